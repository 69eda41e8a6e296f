//! Connection lifecycle management.
//!
//! This module provides:
//! - A pure state machine over [`ConnectionStatus`] driven by
//!   [`ConnectionEvent`]s
//! - [`ConnectionManager`], which deduplicates connection attempts and
//!   reconnects in the background with a bounded, fixed-delay loop
//!
//! # Example
//!
//! ```no_run
//! use docdb_guard::connection::ConnectionManager;
//! use docdb_guard::config::ConnectionConfig;
//! use docdb_guard::driver::TcpProbeDriver;
//!
//! # async fn run() -> docdb_guard::Result<()> {
//! let config = ConnectionConfig::new("mongodb://127.0.0.1:27017/app");
//! let manager = ConnectionManager::new(TcpProbeDriver::new(), config);
//!
//! // Concurrent callers share a single in-flight attempt.
//! let session = manager.ensure_connected().await?;
//! println!("connected to {}", session.addr());
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod manager;
mod state;

pub use manager::{ConnectionManager, ConnectionSnapshot};
pub use state::{Action, ConnectionEvent, ConnectionState, ConnectionStats, ConnectionStatus, Transition};
