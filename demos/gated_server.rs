//! HTTP server whose routes are gated on database readiness.
//!
//! Set DOCDB_GATE_MODE=retry to retry inline instead of rejecting at once.
//!
//! Run: MONGO_URI=mongodb://127.0.0.1:27017/app cargo run --example gated_server
//! Then: curl -i http://127.0.0.1:3000/items

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{middleware, Json, Router};
use docdb_guard::driver::TcpProbeDriver;
use docdb_guard::gate::{ensure_connection, RequestGate};
use docdb_guard::{shutdown, ConnectionManager, Settings};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env().context("failed to load settings")?;
    let gate = RequestGate::from_settings(TcpProbeDriver::new(), settings);
    let manager = gate.manager().clone();

    // Not fatal: the gate rejects until the background loop recovers.
    let _ = manager.start().await;

    let gated = Router::new()
        .route("/items", get(list_items))
        .layer(middleware::from_fn_with_state(
            gate,
            ensure_connection::<TcpProbeDriver>,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .with_state(manager.clone())
        .merge(gated);

    let listener = TcpListener::bind(ADDR)
        .await
        .with_context(|| format!("failed to bind to {ADDR}"))?;
    info!("listening on {ADDR}");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = shutdown::wait_for_signal().await {
                tracing::error!(error = %e, "failed to listen for shutdown signals");
            }
            let _ = stop_tx.send(());
        })
        .await
        .context("HTTP server failed")?;

    let code = shutdown::close_after(&manager, async {
        let _ = stop_rx.await;
    })
    .await;
    std::process::exit(code);
}

async fn list_items() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "items": [] }))
}

async fn health(State(manager): State<ConnectionManager<TcpProbeDriver>>) -> Json<serde_json::Value> {
    let snapshot = manager.snapshot();
    Json(serde_json::json!({
        "status": snapshot.status.to_string(),
        "reconnectAttempts": snapshot.reconnect_attempts,
        "lastError": snapshot.last_error,
    }))
}
