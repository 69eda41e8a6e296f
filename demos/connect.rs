//! Connection manager example.
//!
//! Connects to the database named by MONGO_URI (or MONGODB_URI), reports the
//! connection state every few seconds and closes the connection on Ctrl+C.
//!
//! Run: MONGO_URI=mongodb://127.0.0.1:27017/app cargo run --example connect

use std::time::Duration;

use docdb_guard::driver::TcpProbeDriver;
use docdb_guard::{shutdown, ConnectionManager};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let manager = ConnectionManager::from_env(TcpProbeDriver::new())?;
    shutdown::install(manager.clone());

    match manager.start().await {
        Ok(session) => println!(
            "Connected to {} (database: {})",
            session.addr(),
            session.database().unwrap_or("<default>")
        ),
        Err(e) => println!("Initial connection failed: {e}; retrying in the background"),
    }

    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = manager.snapshot();
        println!(
            "status={} attempts={}/{} last_error={:?}",
            snapshot.status,
            snapshot.reconnect_attempts,
            snapshot.max_reconnect_attempts,
            snapshot.last_error
        );
        if snapshot.retries_exhausted() {
            println!("Giving up automatic retries; press Ctrl+C to exit");
        }
    }
}
