//! Configuration for the connection manager and the request gate.
//!
//! Everything has a default matching a small, serverless-friendly footprint.
//! The only required value is the connection URI, which is read from
//! `MONGO_URI` or, failing that, `MONGODB_URI`. Tunables can be overridden
//! through `DOCDB_`-prefixed environment variables, see [`Settings::from_env`].

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variables consulted for the connection URI, in order.
pub const URI_ENV_VARS: [&str; 2] = ["MONGO_URI", "MONGODB_URI"];

/// Linear backoff: `base`, `2 * base`, `3 * base`, ... capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearBackoff {
    /// Delay after the first failure and increment for each later one.
    pub base: Duration,
    /// Upper bound on a single delay.
    pub max: Duration,
}

impl LinearBackoff {
    /// Multiples of `base`, capped at one minute.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max: Duration::from_secs(60),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max)
    }
}

/// Bounded, fixed-delay policy for the background reconnection loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of automatic reconnection attempts.
    pub max_attempts: u32,
    /// Delay before each automatic attempt.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(5000),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with the given cap and delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Check if another automatic attempt may be made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Options handed to the driver for every connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// How long to wait for a suitable server to answer.
    pub server_selection_timeout: Duration,
    /// Idle timeout on an established socket. The probe driver also bounds
    /// pings with it.
    pub socket_timeout: Duration,
    /// Timeout for the initial TCP connect.
    pub connect_timeout: Duration,
    /// Upper bound on pooled connections, for drivers that pool.
    pub max_pool_size: u32,
    /// Connections kept open while idle.
    pub min_pool_size: u32,
    /// Whether queries reject fields outside the schema. Passed through for
    /// drivers that execute queries.
    pub strict_query: bool,
    /// Whether commands are queued while disconnected.
    pub buffer_commands: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_selection_timeout: Duration::from_millis(20_000),
            socket_timeout: Duration::from_millis(60_000),
            connect_timeout: Duration::from_millis(20_000),
            max_pool_size: 5,
            min_pool_size: 0,
            strict_query: false,
            buffer_commands: false,
        }
    }
}

/// Periodic liveness probing of an established connection.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Number of consecutive failed probes before the connection is
    /// considered lost.
    pub probes: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probes: 3,
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Connection URI. `None` makes every connect attempt fail with a
    /// configuration error.
    pub uri: Option<String>,
    /// Options passed to the driver.
    pub client: ClientOptions,
    /// Enable the background reconnection loop.
    pub auto_reconnect: bool,
    /// Policy for the background reconnection loop.
    pub reconnect: ReconnectPolicy,
    /// Liveness probing, if any.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: None,
            client: ClientOptions::default(),
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            heartbeat: Some(HeartbeatConfig::default()),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given URI with default settings.
    pub fn new(uri: impl Into<String>) -> Self {
        Self::default().with_uri(uri)
    }

    /// Configuration for one-shot invocations: no background loop and no
    /// heartbeat outliving the request.
    pub fn ephemeral(uri: impl Into<String>) -> Self {
        Self::new(uri)
            .with_auto_reconnect(false)
            .without_heartbeat()
    }

    /// Set the connection URI.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the driver options.
    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    /// Enable or disable the background reconnection loop.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnection policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the heartbeat configuration.
    pub fn with_heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = Some(config);
        self
    }

    /// Disable the heartbeat.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }

    /// Return the URI, or a configuration error if it is missing or blank.
    pub fn require_uri(&self) -> Result<&str> {
        match self.uri.as_deref().map(str::trim) {
            Some(uri) if !uri.is_empty() => Ok(uri),
            _ => Err(Error::configuration(format!(
                "database URI is not defined; set {} or {}",
                URI_ENV_VARS[0], URI_ENV_VARS[1]
            ))),
        }
    }
}

/// Retry policy for the request gate's inline mode.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineRetryPolicy {
    /// Total number of `ensure_connected` calls per request.
    pub max_retries: u32,
    /// Delay after the n-th failed call (0-indexed).
    pub backoff: LinearBackoff,
}

impl Default for InlineRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: LinearBackoff::new(Duration::from_millis(1000)),
        }
    }
}

impl InlineRetryPolicy {
    /// `max_retries` calls with linear backoff of `base`, `2 * base`, ...
    pub fn linear(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: LinearBackoff::new(base),
        }
    }

    /// Sum of all delays slept when every call but the last fails.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries.saturating_sub(1))
            .map(|attempt| self.backoff.delay_for_attempt(attempt))
            .sum()
    }
}

/// How the request gate treats a request while the database is not ready.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum GateMode {
    /// Reject immediately with 503; recovery is left to the background loop.
    #[default]
    FastReject,
    /// Retry `ensure_connected` inline before rejecting.
    RetryInline(InlineRetryPolicy),
}

impl GateMode {
    /// Inline retry with the default policy.
    pub fn retry() -> Self {
        GateMode::RetryInline(InlineRetryPolicy::default())
    }
}

/// Everything loadable from the environment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// Connection manager configuration.
    pub connection: ConnectionConfig,
    /// Request gate policy.
    pub gate: GateMode,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load settings from an explicit set of variables.
    ///
    /// Recognized keys (case-insensitive): `MONGO_URI`, `MONGODB_URI`,
    /// `DOCDB_MAX_RECONNECT_ATTEMPTS`, `DOCDB_RECONNECT_DELAY_MS`,
    /// `DOCDB_SERVER_SELECTION_TIMEOUT_MS`, `DOCDB_SOCKET_TIMEOUT_MS`,
    /// `DOCDB_CONNECT_TIMEOUT_MS`, `DOCDB_MAX_POOL_SIZE`,
    /// `DOCDB_MIN_POOL_SIZE`, `DOCDB_AUTO_RECONNECT`,
    /// `DOCDB_HEARTBEAT_INTERVAL_MS`, `DOCDB_GATE_MODE`,
    /// `DOCDB_GATE_MAX_RETRIES`, `DOCDB_GATE_BACKOFF_MS`.
    ///
    /// Selecting the retry gate mode turns off automatic reconnection and
    /// the heartbeat, as [`ConnectionConfig::ephemeral`] does, unless
    /// `DOCDB_AUTO_RECONNECT` or `DOCDB_HEARTBEAT_INTERVAL_MS` say otherwise.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let source: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let env = config::Config::builder()
            .add_source(config::Environment::default().source(Some(source)))
            .build()
            .map_err(|e| Error::configuration(e.to_string()))?;

        let mut connection = ConnectionConfig::default();
        connection.uri = URI_ENV_VARS.iter().find_map(|key| {
            env.get_string(&key.to_lowercase())
                .ok()
                .filter(|value| !value.trim().is_empty())
        });

        let reconnect = &mut connection.reconnect;
        if let Some(n) = get_u32(&env, "docdb_max_reconnect_attempts")? {
            reconnect.max_attempts = n;
        }
        if let Some(ms) = get_opt::<u64>(&env, "docdb_reconnect_delay_ms")? {
            reconnect.delay = Duration::from_millis(ms);
        }
        let auto_reconnect = get_opt::<bool>(&env, "docdb_auto_reconnect")?;
        let heartbeat_ms = get_opt::<u64>(&env, "docdb_heartbeat_interval_ms")?;

        let client = &mut connection.client;
        if let Some(ms) = get_opt::<u64>(&env, "docdb_server_selection_timeout_ms")? {
            client.server_selection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = get_opt::<u64>(&env, "docdb_socket_timeout_ms")? {
            client.socket_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = get_opt::<u64>(&env, "docdb_connect_timeout_ms")? {
            client.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = get_u32(&env, "docdb_max_pool_size")? {
            client.max_pool_size = n;
        }
        if let Some(n) = get_u32(&env, "docdb_min_pool_size")? {
            client.min_pool_size = n;
        }
        if client.min_pool_size > client.max_pool_size {
            return Err(Error::configuration(format!(
                "min pool size {} exceeds max pool size {}",
                client.min_pool_size, client.max_pool_size
            )));
        }

        let gate = match get_opt::<String>(&env, "docdb_gate_mode")?.as_deref() {
            None | Some("fast-reject") | Some("fast_reject") => GateMode::FastReject,
            Some("retry") | Some("retry-inline") | Some("retry_inline") => {
                let mut policy = InlineRetryPolicy::default();
                if let Some(n) = get_u32(&env, "docdb_gate_max_retries")? {
                    policy.max_retries = n.max(1);
                }
                if let Some(ms) = get_opt::<u64>(&env, "docdb_gate_backoff_ms")? {
                    policy.backoff = LinearBackoff::new(Duration::from_millis(ms));
                }
                GateMode::RetryInline(policy)
            }
            Some(other) => {
                return Err(Error::configuration(format!(
                    "unknown gate mode {other:?}; expected \"fast-reject\" or \"retry\""
                )));
            }
        };

        // Inline retry serves invocations that end with the request, so
        // nothing runs in the background unless asked for explicitly.
        let ephemeral = matches!(gate, GateMode::RetryInline(_));
        connection.auto_reconnect = auto_reconnect.unwrap_or(!ephemeral);
        connection.heartbeat = match heartbeat_ms {
            Some(0) => None,
            Some(ms) => Some(HeartbeatConfig {
                interval: Duration::from_millis(ms),
                ..HeartbeatConfig::default()
            }),
            None if ephemeral => None,
            None => Some(HeartbeatConfig::default()),
        };

        debug!(
            uri_present = connection.uri.is_some(),
            ?gate,
            "settings loaded from environment"
        );

        Ok(Self { connection, gate })
    }
}

fn get_opt<'de, T: Deserialize<'de>>(env: &config::Config, key: &str) -> Result<Option<T>> {
    match env.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(Error::configuration(format!("{}: {e}", key.to_uppercase()))),
    }
}

fn get_u32(env: &config::Config, key: &str) -> Result<Option<u32>> {
    get_opt::<u64>(env, key)?
        .map(|n| {
            u32::try_from(n).map_err(|_| {
                Error::configuration(format!("{}: {n} is out of range", key.to_uppercase()))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_is_capped() {
        let backoff = LinearBackoff {
            base: Duration::from_millis(500),
            max: Duration::from_secs(2),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_inline_backoff_is_multiples_of_base() {
        let policy = InlineRetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff.delay_for_attempt(2), Duration::from_millis(3000));
        assert_eq!(policy.total_delay(), Duration::from_millis(3000));
    }

    #[test]
    fn test_reconnect_policy_should_retry() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.client.server_selection_timeout, Duration::from_secs(20));
        assert_eq!(config.client.socket_timeout, Duration::from_secs(60));
        assert_eq!(config.client.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.client.max_pool_size, 5);
        assert_eq!(config.client.min_pool_size, 0);
        assert!(!config.client.buffer_commands);
        assert!(config.require_uri().is_err());
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::ephemeral("mongodb://db:27017/app")
            .with_reconnect_policy(ReconnectPolicy::fixed(2, Duration::from_millis(10)));

        assert!(!config.auto_reconnect);
        assert!(config.heartbeat.is_none());
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.require_uri().unwrap(), "mongodb://db:27017/app");
    }

    #[test]
    fn test_blank_uri_is_missing() {
        let config = ConnectionConfig::new("   ");
        assert!(matches!(config.require_uri(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_settings_uri_precedence() {
        let settings = Settings::from_vars([
            ("MONGO_URI", "mongodb://primary/app"),
            ("MONGODB_URI", "mongodb://fallback/app"),
        ])
        .unwrap();
        assert_eq!(settings.connection.uri.as_deref(), Some("mongodb://primary/app"));

        let settings = Settings::from_vars([
            ("MONGO_URI", ""),
            ("MONGODB_URI", "mongodb://fallback/app"),
        ])
        .unwrap();
        assert_eq!(settings.connection.uri.as_deref(), Some("mongodb://fallback/app"));
    }

    #[test]
    fn test_settings_without_uri() {
        let settings = Settings::from_vars([("PATH", "/usr/bin")]).unwrap();
        assert!(settings.connection.uri.is_none());
        assert_eq!(settings.gate, GateMode::FastReject);
        assert_eq!(settings.connection.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_settings_overrides() {
        let settings = Settings::from_vars([
            ("MONGODB_URI", "mongodb://db/app"),
            ("DOCDB_MAX_RECONNECT_ATTEMPTS", "4"),
            ("DOCDB_RECONNECT_DELAY_MS", "250"),
            ("DOCDB_MAX_POOL_SIZE", "10"),
            ("DOCDB_CONNECT_TIMEOUT_MS", "1500"),
            ("DOCDB_HEARTBEAT_INTERVAL_MS", "0"),
            ("DOCDB_GATE_MODE", "retry"),
            ("DOCDB_GATE_MAX_RETRIES", "5"),
            ("DOCDB_GATE_BACKOFF_MS", "100"),
        ])
        .unwrap();

        let connection = &settings.connection;
        assert_eq!(connection.reconnect.max_attempts, 4);
        assert_eq!(connection.reconnect.delay, Duration::from_millis(250));
        assert_eq!(connection.client.max_pool_size, 10);
        assert_eq!(connection.client.connect_timeout, Duration::from_millis(1500));
        assert!(connection.heartbeat.is_none());
        assert_eq!(
            settings.gate,
            GateMode::RetryInline(InlineRetryPolicy::linear(5, Duration::from_millis(100)))
        );
    }

    #[test]
    fn test_retry_mode_defaults_to_ephemeral_connection() {
        let settings = Settings::from_vars([
            ("MONGO_URI", "mongodb://db/app"),
            ("DOCDB_GATE_MODE", "retry"),
        ])
        .unwrap();
        assert!(!settings.connection.auto_reconnect);
        assert!(settings.connection.heartbeat.is_none());

        let settings = Settings::from_vars([
            ("MONGO_URI", "mongodb://db/app"),
            ("DOCDB_GATE_MODE", "retry"),
            ("DOCDB_AUTO_RECONNECT", "true"),
            ("DOCDB_HEARTBEAT_INTERVAL_MS", "10000"),
        ])
        .unwrap();
        assert!(settings.connection.auto_reconnect);
        assert_eq!(
            settings.connection.heartbeat.map(|h| h.interval),
            Some(Duration::from_secs(10))
        );

        let settings = Settings::from_vars([("MONGO_URI", "mongodb://db/app")]).unwrap();
        assert!(settings.connection.auto_reconnect);
        assert_eq!(settings.connection.heartbeat, Some(HeartbeatConfig::default()));
    }

    #[test]
    fn test_settings_rejects_garbage() {
        let err = Settings::from_vars([("DOCDB_RECONNECT_DELAY_MS", "soon")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Settings::from_vars([("DOCDB_GATE_MODE", "sometimes")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Settings::from_vars([("DOCDB_MIN_POOL_SIZE", "8")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
