//! Test utilities: a driver whose outcomes are scripted up front.

#![cfg(test)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ClientOptions, ConnectionConfig, ReconnectPolicy};
use crate::driver::{Driver, DriverResult};
use crate::error::DriverError;

pub const TEST_URI: &str = "mongodb://db.test:27017/app";

/// Config with a URI, the default reconnect policy and no heartbeat.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::new(TEST_URI).without_heartbeat()
}

/// Same as [`test_config`] with a custom reconnect policy.
pub fn test_config_with(max_attempts: u32, delay: Duration) -> ConnectionConfig {
    test_config().with_reconnect_policy(ReconnectPolicy::fixed(max_attempts, delay))
}

#[derive(Default)]
struct Script {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: AtomicBool,
    connect_delay: Mutex<Duration>,
    connects: AtomicU32,
    closes: AtomicU32,
    alive: AtomicBool,
    fail_close: AtomicBool,
}

/// A driver that succeeds or fails according to a script.
///
/// Handles are the 1-based number of the `connect` call that produced them.
#[derive(Clone)]
pub struct ScriptedDriver {
    script: Arc<Script>,
}

impl ScriptedDriver {
    /// Plays `outcomes` in order, then keeps returning `fallback`.
    pub fn new(outcomes: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        let script = Script {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            fallback: AtomicBool::new(fallback),
            alive: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            script: Arc::new(script),
        }
    }

    pub fn succeeding() -> Self {
        Self::new([], true)
    }

    pub fn failing() -> Self {
        Self::new([], false)
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.script.connect_delay.lock().unwrap() = delay;
        self
    }

    pub fn set_fallback(&self, succeed: bool) {
        self.script.fallback.store(succeed, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.script.alive.store(alive, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.script.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.script.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    type Handle = u32;

    async fn connect(&self, _uri: &str, _options: &ClientOptions) -> DriverResult<u32> {
        let n = self.script.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.script.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let succeed = self
            .script
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.script.fallback.load(Ordering::SeqCst));

        if succeed {
            Ok(n)
        } else {
            Err(DriverError::other(format!("scripted failure #{n}")))
        }
    }

    async fn ping(&self, _handle: &u32) -> bool {
        self.script.alive.load(Ordering::SeqCst)
    }

    async fn close(&self, _handle: &u32) -> DriverResult<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_close.load(Ordering::SeqCst) {
            Err(DriverError::other("close refused"))
        } else {
            Ok(())
        }
    }
}
