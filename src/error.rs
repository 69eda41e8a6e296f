//! Error types for connection management and request gating.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`Driver`](crate::driver::Driver) implementation.
///
/// Cloneable so that the outcome of a single connection attempt can be
/// handed to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The operation did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The connection URI could not be understood by the driver.
    #[error("invalid connection URI: {0}")]
    InvalidUri(String),

    /// Any other driver-specific failure.
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl DriverError {
    /// Create a driver error from a message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Errors that can occur while establishing or gating on a connection.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A connection attempt failed.
    #[error("connection failed: {0}")]
    Connection(#[source] DriverError),

    /// The request gate refused a request because the database is not ready.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The manager has been shut down and accepts no further work.
    #[error("connection manager is shut down")]
    Shutdown,

    /// Closing the underlying connection failed.
    #[error("failed to close connection: {0}")]
    Close(#[source] DriverError),
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new service-unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Check if this error is worth retrying automatically.
    ///
    /// Configuration problems and shutdown are permanent; everything the
    /// driver reports while connecting is treated as transient.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ServiceUnavailable(_))
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Self::Connection(err)
    }
}
