//! Per-request gating on connection readiness.
//!
//! [`RequestGate::check`] decides whether a request may proceed. Two policies
//! are available through [`GateMode`]:
//!
//! - [`GateMode::FastReject`] (default): a synchronous readiness check. Not
//!   ready means an immediate rejection; recovery is left to the manager's
//!   background loop.
//! - [`GateMode::RetryInline`]: `ensure_connected` is retried in the request
//!   path with increasing delays before giving up. Meant for one-shot
//!   invocations where no background loop outlives the request.
//!
//! With the `http` feature, [`ensure_connection`] wraps the gate as axum
//! middleware answering rejections with `503 Service Unavailable`.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{ensure_connection, GateRejection, RejectionBody};

pub use crate::config::{GateMode, InlineRetryPolicy};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::driver::Driver;
use crate::error::{Error, Result};

/// Message returned to clients when a request is rejected.
pub const UNAVAILABLE_MESSAGE: &str = "Database connection failed. Please try again later.";

/// Decides whether a request may proceed given the connection state.
pub struct RequestGate<D: Driver> {
    manager: ConnectionManager<D>,
    mode: GateMode,
}

impl<D: Driver> Clone for RequestGate<D> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            mode: self.mode.clone(),
        }
    }
}

impl<D: Driver> RequestGate<D> {
    /// Create a gate over `manager` using `mode`.
    pub fn new(manager: ConnectionManager<D>, mode: GateMode) -> Self {
        Self { manager, mode }
    }

    /// Fast-reject gate.
    pub fn fast_reject(manager: ConnectionManager<D>) -> Self {
        Self::new(manager, GateMode::FastReject)
    }

    /// Build a manager and a gate from loaded settings.
    pub fn from_settings(driver: D, settings: Settings) -> Self {
        Self::new(ConnectionManager::new(driver, settings.connection), settings.gate)
    }

    /// The manager this gate consults.
    pub fn manager(&self) -> &ConnectionManager<D> {
        &self.manager
    }

    /// The active policy.
    pub fn mode(&self) -> &GateMode {
        &self.mode
    }

    /// Let the request through or reject it.
    ///
    /// # Errors
    ///
    /// Always [`Error::ServiceUnavailable`]; the underlying cause is logged.
    pub async fn check(&self) -> Result<()> {
        match &self.mode {
            GateMode::FastReject => {
                if self.manager.is_ready() {
                    Ok(())
                } else {
                    debug!(status = %self.manager.status(), "database not ready, rejecting");
                    Err(Error::unavailable(UNAVAILABLE_MESSAGE))
                }
            }
            GateMode::RetryInline(policy) => self.retry_inline(policy).await,
        }
    }

    async fn retry_inline(&self, policy: &InlineRetryPolicy) -> Result<()> {
        let max_retries = policy.max_retries.max(1);
        let mut failures = 0;

        loop {
            let err = match self.manager.ensure_connected().await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };

            failures += 1;
            if failures >= max_retries || !err.is_recoverable() {
                warn!(failures, error = %err, "database connection failed, rejecting request");
                return Err(Error::unavailable(UNAVAILABLE_MESSAGE));
            }

            let delay = policy.backoff.delay_for_attempt(failures - 1);
            info!(
                attempt = failures,
                max = max_retries - 1,
                ?delay,
                "database not ready, retrying"
            );
            sleep(delay).await;
        }
    }
}

impl<D: Driver> std::fmt::Debug for RequestGate<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("mode", &self.mode)
            .field("manager", &self.manager)
            .finish()
    }
}
