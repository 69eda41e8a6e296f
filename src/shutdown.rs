//! Process shutdown hook.
//!
//! On SIGINT or SIGTERM the connection is closed and the process exits with
//! code 0, or 1 if closing failed.

use std::future::Future;
use std::io;

use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::connection::ConnectionManager;
use crate::driver::Driver;
use crate::error::Result;

/// Exit code after a clean close.
pub const EXIT_OK: i32 = 0;
/// Exit code when closing the connection failed.
pub const EXIT_CLOSE_FAILED: i32 = 1;

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM. Returns the signal name.
pub async fn wait_for_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<(), io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<io::Result<()>>();

    tokio::select! {
        result = signal::ctrl_c() => result.map(|()| "SIGINT"),
        result = terminate => result.map(|()| "SIGTERM"),
    }
}

/// Map the outcome of [`ConnectionManager::shutdown`] to a process exit code.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => EXIT_OK,
        Err(_) => EXIT_CLOSE_FAILED,
    }
}

/// Close the connection once `trigger` completes and return the exit code.
pub async fn close_after<D, F>(manager: &ConnectionManager<D>, trigger: F) -> i32
where
    D: Driver,
    F: Future<Output = ()>,
{
    trigger.await;
    let result = manager.shutdown().await;
    match &result {
        Ok(()) => info!("database connection closed, exiting"),
        Err(e) => error!(error = %e, "error closing database connection"),
    }
    exit_code(&result)
}

/// Close the connection on the next termination signal and return the exit
/// code, without exiting.
pub async fn close_on_signal<D: Driver>(manager: &ConnectionManager<D>) -> io::Result<i32> {
    let name = wait_for_signal().await?;
    info!(signal = name, "received shutdown signal");
    Ok(close_after(manager, async {}).await)
}

/// Spawn the shutdown hook: on SIGINT/SIGTERM close the connection and exit
/// the process.
pub fn install<D: Driver>(manager: ConnectionManager<D>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match close_on_signal(&manager).await {
            Ok(code) => std::process::exit(code),
            Err(e) => error!(error = %e, "failed to listen for shutdown signals"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::error::Error;
    use crate::testing::{test_config, ScriptedDriver};

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(Error::Shutdown)), 1);
    }

    #[tokio::test]
    async fn test_close_after_trigger() {
        let driver = ScriptedDriver::succeeding();
        let manager = ConnectionManager::new(driver.clone(), test_config());
        manager.ensure_connected().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let hook = tokio::spawn({
            let manager = manager.clone();
            async move {
                close_after(&manager, async {
                    let _ = rx.await;
                })
                .await
            }
        });

        tokio::task::yield_now().await;
        assert!(manager.is_ready());

        tx.send(()).unwrap();
        assert_eq!(hook.await.unwrap(), EXIT_OK);
        assert_eq!(driver.close_calls(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_close_failure_exit_code() {
        let driver = ScriptedDriver::succeeding();
        driver.fail_close();
        let manager = ConnectionManager::new(driver, test_config());
        manager.ensure_connected().await.unwrap();

        assert_eq!(close_after(&manager, async {}).await, EXIT_CLOSE_FAILED);
    }

    #[tokio::test]
    async fn test_close_without_connection() {
        let manager = ConnectionManager::new(ScriptedDriver::succeeding(), test_config());
        assert_eq!(close_after(&manager, async {}).await, EXIT_OK);
    }
}
