//! The seam between the connection manager and a database client.
//!
//! A [`Driver`] performs all network I/O. The manager only decides when to
//! call it, which keeps the state machine testable without a database.
//!
//! Drivers that observe the connection on their own (topology monitors,
//! socket readers) report what they see through
//! [`ConnectionManager::notify`](crate::connection::ConnectionManager::notify)
//! with a [`DriverEvent`].

mod tcp;

pub use tcp::{Endpoint, TcpProbeDriver, TcpSession, DEFAULT_PORT};

use async_trait::async_trait;

use crate::config::ClientOptions;
use crate::connection::ConnectionEvent;
use crate::error::DriverError;

/// Result type alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A database client able to open, probe and close a connection.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Handle to an established connection, shared with every caller of
    /// `ensure_connected`.
    type Handle: Clone + Send + Sync + 'static;

    /// Open a connection to `uri`, honoring the timeouts in `options`.
    async fn connect(&self, uri: &str, options: &ClientOptions) -> DriverResult<Self::Handle>;

    /// Check that an established connection is still usable.
    async fn ping(&self, handle: &Self::Handle) -> bool;

    /// Close an established connection.
    async fn close(&self, handle: &Self::Handle) -> DriverResult<()>;
}

/// Lifecycle events a driver may report asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The connection became usable.
    Connected,
    /// The driver hit an error.
    Error(String),
    /// The connection was lost.
    Disconnected,
}

impl From<DriverEvent> for ConnectionEvent {
    fn from(event: DriverEvent) -> Self {
        match event {
            DriverEvent::Connected => ConnectionEvent::Connected,
            DriverEvent::Error(message) => ConnectionEvent::Failed(message),
            DriverEvent::Disconnected => ConnectionEvent::Disconnected,
        }
    }
}
