//! Connection lifecycle management for remote document databases.
//!
//! This crate keeps a single database connection healthy for a long-running
//! server or a short-lived serverless invocation, and gates HTTP requests on
//! whether that connection is usable.
//!
//! # Features
//!
//! - Idempotent [`ensure_connected`](connection::ConnectionManager::ensure_connected)
//!   with at most one connection attempt in flight
//! - Explicit, pure connection state machine
//! - Bounded, fixed-delay background reconnection
//! - Optional heartbeat that detects silently dropped connections
//! - Request gate with fast-reject and inline-retry policies, plus axum
//!   middleware (`http` feature, on by default)
//! - SIGINT/SIGTERM shutdown hook
//!
//! # Example
//!
//! ```no_run
//! use axum::{middleware, routing::get, Router};
//! use docdb_guard::config::Settings;
//! use docdb_guard::driver::TcpProbeDriver;
//! use docdb_guard::gate::{ensure_connection, RequestGate};
//! use docdb_guard::shutdown;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // MONGO_URI or MONGODB_URI must be set.
//!     let gate = RequestGate::from_settings(TcpProbeDriver::new(), Settings::from_env()?);
//!     let manager = gate.manager().clone();
//!
//!     // Failure is not fatal: the background loop keeps trying.
//!     let _ = manager.start().await;
//!     shutdown::install(manager);
//!
//!     let app: Router = Router::new()
//!         .route("/items", get(|| async { "[]" }))
//!         .layer(middleware::from_fn_with_state(gate, ensure_connection::<TcpProbeDriver>));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! # State machine
//!
//! ```text
//!  Disconnected ── ensure_connected ──▶ Connecting ── success ──▶ Connected
//!       ▲                                 │    ▲                     │
//!       │                         failure │    │ retry after delay   │
//!       │                                 ▼    │ (attempts < max)    │
//!       │                                Error ┘                     │
//!       └─────────── connection lost (reconnect scheduled) ──────────┘
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod gate;
pub mod shutdown;

mod testing;

// Re-export commonly used types at the crate root
pub use config::{ConnectionConfig, GateMode, Settings};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use error::{DriverError, Error, Result};
pub use gate::RequestGate;
