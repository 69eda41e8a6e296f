//! The connection manager.
//!
//! Owns the connection state and the driver handle, deduplicates concurrent
//! connection attempts and runs the bounded background reconnection loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, Settings};
use crate::driver::{Driver, DriverEvent};
use crate::error::{DriverError, Error, Result};

use super::state::{
    Action, ConnectionEvent, ConnectionState, ConnectionStats, ConnectionStatus, Transition,
};

/// Published outcome of one connection attempt. `None` while in flight.
type Outcome<H> = Option<Result<H>>;

/// Point-in-time view of a manager's state.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    /// Current status.
    pub status: ConnectionStatus,
    /// Automatic attempts since the last successful connection.
    pub reconnect_attempts: u32,
    /// Configured cap on automatic attempts.
    pub max_reconnect_attempts: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Whether the manager has been shut down.
    pub closed: bool,
    /// Connection statistics.
    pub stats: ConnectionStats,
}

impl ConnectionSnapshot {
    /// The loop gave up: the state is `Error` and the cap is reached.
    pub fn retries_exhausted(&self) -> bool {
        self.status == ConnectionStatus::Error
            && self.reconnect_attempts >= self.max_reconnect_attempts
    }
}

struct Shared<H> {
    state: ConnectionState,
    handle: Option<H>,
    in_flight: Option<watch::Receiver<Outcome<H>>>,
    reconnecting: bool,
}

struct Inner<D: Driver> {
    driver: D,
    config: ConnectionConfig,
    shared: Mutex<Shared<D::Handle>>,
    heartbeat_running: AtomicBool,
}

impl<D: Driver> Inner<D> {
    fn lock(&self) -> MutexGuard<'_, Shared<D::Handle>> {
        // State stays consistent across a panicking holder: every critical
        // section is a plain field update.
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Pending<H> {
    Ready(H),
    Wait(watch::Receiver<Outcome<H>>),
}

/// Manages the lifecycle of a single database connection.
///
/// Cheap to clone; clones share the same state. Hand one to every component
/// that needs a live connection, call [`ensure_connected`] before use.
///
/// [`ensure_connected`]: ConnectionManager::ensure_connected
pub struct ConnectionManager<D: Driver> {
    inner: Arc<Inner<D>>,
}

impl<D: Driver> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> ConnectionManager<D> {
    /// Create a manager in the `Disconnected` state. No I/O happens until
    /// the first call to [`ensure_connected`](Self::ensure_connected).
    pub fn new(driver: D, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                config,
                shared: Mutex::new(Shared {
                    state: ConnectionState::new(),
                    handle: None,
                    in_flight: None,
                    reconnecting: false,
                }),
                heartbeat_running: AtomicBool::new(false),
            }),
        }
    }

    /// Create a manager configured from the process environment.
    pub fn from_env(driver: D) -> Result<Self> {
        Ok(Self::new(driver, Settings::from_env()?.connection))
    }

    /// The configuration this manager was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().state.status()
    }

    /// Connected and not shut down. Does no I/O.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().state.is_ready()
    }

    /// Connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().state.stats().clone()
    }

    /// Snapshot of the current state.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let shared = self.inner.lock();
        let state = &shared.state;
        ConnectionSnapshot {
            status: state.status(),
            reconnect_attempts: state.reconnect_attempts(),
            max_reconnect_attempts: self.inner.config.reconnect.max_attempts,
            last_error: state.last_error().map(str::to_string),
            closed: state.is_closed(),
            stats: state.stats().clone(),
        }
    }

    /// Return a live connection handle, connecting if necessary.
    ///
    /// - Connected and the driver confirms liveness: the existing handle is
    ///   returned without a new attempt.
    /// - An attempt is already in flight: its outcome is awaited and shared.
    /// - Otherwise a fresh attempt is started.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when no URI is configured (no attempt is
    /// made), [`Error::Connection`] when the attempt fails and
    /// [`Error::Shutdown`] after [`shutdown`](Self::shutdown).
    pub async fn ensure_connected(&self) -> Result<D::Handle> {
        let cached = {
            let shared = self.inner.lock();
            if shared.state.is_closed() {
                return Err(Error::Shutdown);
            }
            if shared.state.is_ready() {
                shared.handle.clone()
            } else {
                None
            }
        };

        if let Some(handle) = cached {
            if self.inner.driver.ping(&handle).await {
                debug!("using existing database connection");
                return Ok(handle);
            }
            warn!("existing database connection failed liveness check");
            self.handle_event(ConnectionEvent::Disconnected);
        }

        match self.join_or_start()? {
            Pending::Ready(handle) => Ok(handle),
            Pending::Wait(rx) => self.wait_for(rx).await,
        }
    }

    /// Reset the attempt counter and connect, re-arming automatic retries
    /// after the cap was reached.
    pub async fn reconnect(&self) -> Result<D::Handle> {
        self.inner.lock().state.reset_attempts();
        info!("manual reconnection requested");
        self.ensure_connected().await
    }

    /// Connect at process start.
    ///
    /// A failed first attempt leaves the background loop armed (when auto
    /// reconnect is enabled) and is returned so the caller can decide
    /// whether to keep serving. Starts the heartbeat if one is configured.
    pub async fn start(&self) -> Result<D::Handle> {
        self.spawn_heartbeat();
        let result = self.ensure_connected().await;
        if let Err(e) = &result {
            error!(error = %e, "initial database connection failed");
        }
        result
    }

    /// Report a lifecycle event observed by the driver.
    pub fn notify(&self, event: DriverEvent) {
        match &event {
            DriverEvent::Connected => info!("driver reports connection established"),
            DriverEvent::Error(message) => error!(error = %message, "driver reports connection error"),
            DriverEvent::Disconnected => warn!("driver reports connection lost"),
        }
        self.handle_event(event.into());
    }

    /// Close the connection and refuse further work. Idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::Close`] if the driver fails to close the handle.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = {
            let mut shared = self.inner.lock();
            self.apply(&mut shared, ConnectionEvent::ShutdownRequested);
            shared.handle.take()
        };

        let Some(handle) = handle else {
            return Ok(());
        };

        match self.inner.driver.close(&handle).await {
            Ok(()) => {
                info!("database connection closed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "error closing database connection");
                Err(Error::Close(e))
            }
        }
    }

    /// Spawn a task probing the live connection every heartbeat interval.
    ///
    /// After `probes` consecutive failed pings the connection is reported as
    /// lost, which arms the reconnection loop. Returns `None` when no
    /// heartbeat is configured or one is already running.
    pub fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let config = self.inner.config.heartbeat.clone()?;
        if self.inner.heartbeat_running.swap(true, Ordering::AcqRel) {
            return None;
        }

        let manager = self.clone();
        Some(tokio::spawn(async move {
            debug!(interval = ?config.interval, probes = config.probes, "heartbeat started");
            let mut failures = 0;
            loop {
                sleep(config.interval).await;

                let handle = {
                    let shared = manager.inner.lock();
                    if shared.state.is_closed() {
                        break;
                    }
                    if shared.state.is_ready() {
                        shared.handle.clone()
                    } else {
                        None
                    }
                };
                let Some(handle) = handle else {
                    failures = 0;
                    continue;
                };

                if manager.inner.driver.ping(&handle).await {
                    failures = 0;
                    continue;
                }

                failures += 1;
                warn!(failures, probes = config.probes, "heartbeat ping failed");
                if failures >= config.probes {
                    failures = 0;
                    manager.notify(DriverEvent::Disconnected);
                }
            }
            manager.inner.heartbeat_running.store(false, Ordering::Release);
            debug!("heartbeat stopped");
        }))
    }

    fn join_or_start(&self) -> Result<Pending<D::Handle>> {
        let mut shared = self.inner.lock();
        if shared.state.is_closed() {
            return Err(Error::Shutdown);
        }
        if let Some(rx) = &shared.in_flight {
            debug!("connection attempt already in progress, waiting");
            return Ok(Pending::Wait(rx.clone()));
        }
        // Another caller may have finished an attempt since the fast path.
        if shared.state.is_ready() {
            if let Some(handle) = shared.handle.clone() {
                return Ok(Pending::Ready(handle));
            }
        }

        let uri = self.inner.config.require_uri()?.to_string();

        self.apply(&mut shared, ConnectionEvent::ConnectRequested);
        let (tx, rx) = watch::channel(None);
        shared.in_flight = Some(rx.clone());
        drop(shared);

        let manager = self.clone();
        tokio::spawn(async move { manager.run_attempt(uri, tx).await });
        Ok(Pending::Wait(rx))
    }

    async fn run_attempt(self, uri: String, tx: watch::Sender<Outcome<D::Handle>>) {
        info!("connecting to database");
        let result = self.inner.driver.connect(&uri, &self.inner.config.client).await;

        let mut stale = None;
        let mut schedule = false;
        let outcome = {
            let mut shared = self.inner.lock();
            shared.in_flight = None;

            match result {
                Ok(handle) if shared.state.is_closed() => {
                    stale = Some(handle);
                    Err(Error::Shutdown)
                }
                Ok(handle) => {
                    // A driver error event may have landed while connecting;
                    // the successful attempt wins.
                    if !shared.state.status().is_connecting() {
                        self.apply(&mut shared, ConnectionEvent::ConnectRequested);
                    }
                    self.apply(&mut shared, ConnectionEvent::Connected);
                    stale = shared.handle.replace(handle.clone());
                    info!("database connected successfully");
                    Ok(handle)
                }
                Err(e) => {
                    error!(error = %e, "database connection failed");
                    let transition = self.apply(&mut shared, ConnectionEvent::Failed(e.to_string()));
                    schedule = self.follow_up(&mut shared, transition);
                    Err(Error::Connection(e))
                }
            }
        };

        tx.send_replace(Some(outcome));

        if schedule {
            self.spawn_reconnection();
        }
        if let Some(handle) = stale {
            if let Err(e) = self.inner.driver.close(&handle).await {
                debug!(error = %e, "error closing superseded connection");
            }
        }
    }

    async fn wait_for(&self, mut rx: watch::Receiver<Outcome<D::Handle>>) -> Result<D::Handle> {
        if let Ok(outcome) = rx.wait_for(Option::is_some).await {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
        }

        // The attempt task died without publishing an outcome.
        let mut shared = self.inner.lock();
        if shared.in_flight.as_ref().is_some_and(|r| r.same_channel(&rx)) {
            shared.in_flight = None;
            self.apply(&mut shared, ConnectionEvent::Failed("connection attempt aborted".into()));
        }
        Err(Error::Connection(DriverError::other("connection attempt aborted")))
    }

    fn handle_event(&self, event: ConnectionEvent) {
        let schedule = {
            let mut shared = self.inner.lock();
            let transition = self.apply(&mut shared, event);
            self.follow_up(&mut shared, transition)
        };
        if schedule {
            self.spawn_reconnection();
        }
    }

    fn apply(&self, shared: &mut Shared<D::Handle>, event: ConnectionEvent) -> Transition {
        let label = format!("{event:?}");
        let transition = shared.state.apply(event, &self.inner.config.reconnect);
        if transition.action == Action::Ignored {
            debug!(event = %label, status = %transition.from, "event ignored");
        } else if transition.from != transition.to {
            info!(
                event = %label,
                from = %transition.from,
                to = %transition.to,
                "connection state changed"
            );
        }
        transition
    }

    /// Act on a transition while still holding the lock. Returns true when
    /// the caller must spawn the reconnection loop.
    fn follow_up(&self, shared: &mut Shared<D::Handle>, transition: Transition) -> bool {
        match transition.action {
            Action::ScheduleReconnect { delay } => {
                if !self.inner.config.auto_reconnect {
                    debug!("automatic reconnection disabled");
                    return false;
                }
                if shared.reconnecting {
                    debug!("reconnection already scheduled");
                    return false;
                }
                info!(?delay, "scheduling reconnection");
                shared.reconnecting = true;
                true
            }
            Action::RetriesExhausted => {
                error!(
                    max_attempts = self.inner.config.reconnect.max_attempts,
                    "maximum reconnection attempts reached"
                );
                false
            }
            Action::None | Action::Attempt { .. } | Action::Ignored => false,
        }
    }

    fn spawn_reconnection(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.clone();
                runtime.spawn(async move { manager.attempt_reconnection().await });
            }
            Err(_) => {
                error!("no async runtime available; reconnection not scheduled");
                self.inner.lock().reconnecting = false;
            }
        }
    }

    /// Bounded retry loop. Exactly one runs at a time; `reconnecting` is set
    /// by whoever spawned it and cleared here under the same lock that
    /// decides whether another iteration is needed.
    async fn attempt_reconnection(&self) {
        let policy = &self.inner.config.reconnect;
        loop {
            sleep(policy.delay).await;

            let attempt = {
                let mut shared = self.inner.lock();
                if shared.state.is_closed() || shared.state.is_ready() {
                    shared.reconnecting = false;
                    return;
                }
                match self.apply(&mut shared, ConnectionEvent::RetryStarted).action {
                    Action::Attempt { attempt } => attempt,
                    _ => {
                        shared.reconnecting = false;
                        return;
                    }
                }
            };

            info!(attempt, max_attempts = policy.max_attempts, "attempting to reconnect to database");

            match self.ensure_connected().await {
                Ok(_) => info!(attempt, "reconnected to database"),
                Err(Error::Configuration(message)) => {
                    error!(error = %message, "reconnection stopped");
                    self.inner.lock().reconnecting = false;
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "reconnection attempt failed"),
            }

            let mut shared = self.inner.lock();
            if shared.state.is_closed()
                || shared.state.is_ready()
                || !policy.should_retry(shared.state.reconnect_attempts())
            {
                shared.reconnecting = false;
                return;
            }
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("status", &shared.state.status())
            .field("reconnect_attempts", &shared.state.reconnect_attempts())
            .field("in_flight", &shared.in_flight.is_some())
            .finish()
    }
}
