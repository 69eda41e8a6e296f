//! Connection state machine.
//!
//! [`ConnectionState::apply`] is the only way the status changes. It is a
//! pure function of the current state, an event and the reconnect policy;
//! the manager performs whatever I/O the returned [`Action`] asks for.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::ReconnectPolicy;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Not connected.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and ready.
    Connected,
    /// The last attempt failed.
    Error,
}

impl ConnectionStatus {
    /// Check if the connection is usable.
    pub fn is_connected(&self) -> bool {
        *self == ConnectionStatus::Connected
    }

    /// Check if a connection attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        *self == ConnectionStatus::Connecting
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lifecycle events consumed by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A fresh connection attempt is about to start.
    ConnectRequested,
    /// The driver established the connection.
    Connected,
    /// The driver reported a failure.
    Failed(String),
    /// The driver lost an established connection.
    Disconnected,
    /// The reconnection loop is about to make an automatic attempt.
    RetryStarted,
    /// Graceful shutdown; terminal.
    ShutdownRequested,
}

/// Follow-up work requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    None,
    /// Arm the reconnection loop; the next attempt starts after `delay`.
    ScheduleReconnect {
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Go ahead with automatic attempt number `attempt` (1-based).
    Attempt {
        /// The attempt number, equal to the updated counter.
        attempt: u32,
    },
    /// The cap is reached; no further automatic attempts.
    RetriesExhausted,
    /// The event does not apply in the current state.
    Ignored,
}

/// Result of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Status before the event.
    pub from: ConnectionStatus,
    /// Status after the event.
    pub to: ConnectionStatus,
    /// Follow-up work.
    pub action: Action,
}

/// Connection statistics.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of successful connections.
    pub connect_count: u64,
    /// Number of connection failures.
    pub failure_count: u64,
    /// Number of automatic reconnection attempts.
    pub reconnect_count: u64,
    /// Time of last successful connection.
    pub last_connected: Option<Instant>,
    /// Time of last disconnect.
    pub last_disconnected: Option<Instant>,
    /// Time of last error.
    pub last_error_at: Option<Instant>,
}

impl ConnectionStats {
    /// Record a successful connection.
    pub fn record_connect(&mut self) {
        self.connect_count += 1;
        self.last_connected = Some(Instant::now());
    }

    /// Record a disconnection.
    pub fn record_disconnect(&mut self) {
        self.last_disconnected = Some(Instant::now());
    }

    /// Record a connection failure.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_error_at = Some(Instant::now());
    }

    /// Record a reconnection attempt.
    pub fn record_reconnect(&mut self) {
        self.reconnect_count += 1;
    }

    /// Time since the last successful connection.
    pub fn uptime(&self) -> Option<Duration> {
        self.last_connected.map(|t| t.elapsed())
    }
}

/// The connection state owned by a manager.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    last_error: Option<String>,
    closed: bool,
    stats: ConnectionStats,
}

impl ConnectionState {
    /// Fresh state: disconnected, no attempts made.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Automatic attempts made since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether shutdown has been requested.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Connected and not shut down.
    pub fn is_ready(&self) -> bool {
        !self.closed && self.status.is_connected()
    }

    /// Connection statistics.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Set the counter back to zero, re-arming automatic retries.
    pub fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Apply an event and report the resulting transition.
    pub fn apply(&mut self, event: ConnectionEvent, policy: &ReconnectPolicy) -> Transition {
        let from = self.status;
        if self.closed {
            return self.transition(from, Action::Ignored);
        }

        use ConnectionEvent as E;
        use ConnectionStatus as S;
        let action = match (from, event) {
            (S::Disconnected | S::Error, E::ConnectRequested) => {
                self.status = S::Connecting;
                Action::None
            }
            (S::Connecting, E::Connected) => {
                self.status = S::Connected;
                self.reconnect_attempts = 0;
                self.last_error = None;
                self.stats.record_connect();
                Action::None
            }
            (S::Connecting | S::Connected, E::Failed(message)) => {
                self.status = S::Error;
                self.last_error = Some(message);
                self.stats.record_failure();
                if policy.should_retry(self.reconnect_attempts) {
                    Action::ScheduleReconnect {
                        delay: policy.delay,
                    }
                } else {
                    Action::RetriesExhausted
                }
            }
            (S::Connected, E::Disconnected) => {
                self.status = S::Disconnected;
                self.stats.record_disconnect();
                Action::ScheduleReconnect {
                    delay: policy.delay,
                }
            }
            (S::Connected, E::RetryStarted) => Action::Ignored,
            (_, E::RetryStarted) => {
                if policy.should_retry(self.reconnect_attempts) {
                    self.reconnect_attempts += 1;
                    self.stats.record_reconnect();
                    Action::Attempt {
                        attempt: self.reconnect_attempts,
                    }
                } else {
                    Action::RetriesExhausted
                }
            }
            (_, E::ShutdownRequested) => {
                if self.status.is_connected() {
                    self.stats.record_disconnect();
                }
                self.status = S::Disconnected;
                self.closed = true;
                Action::None
            }
            _ => Action::Ignored,
        };

        self.transition(from, action)
    }

    fn transition(&self, from: ConnectionStatus, action: Action) -> Transition {
        Transition {
            from,
            to: self.status,
            action,
        }
    }
}
