//! Session tuning knobs, shared live between the operator and the session.
//!
//! [`LiveConfig`] is read on every rate-limit check, so changes made through
//! [`LiveConfig::replace`] or [`LiveConfig::set_message_limit`] apply to the
//! very next outgoing line without restarting the session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::throttle::{DEFAULT_WINDOW, RatePolicy};

/// Session settings. Every field has a default, so a partial `[session]`
/// table in a config file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Non-priority chat lines allowed per window.
    pub message_limit: f64,
    pub window_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How often to warn when the session cannot send.
    pub reminder_interval_ms: u64,
    /// Wait before retrying a line sent ahead of the handshake.
    pub not_connected_grace_ms: u64,
    /// Pause around the connect step of a reconnect.
    pub reconnect_pause_ms: u64,
    /// Time given to `QUIT` to flush before the socket is closed.
    pub quit_flush_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            message_limit: 20.0,
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
            min_backoff_ms: 5,
            max_backoff_ms: 300_000,
            reminder_interval_ms: 900_000,
            not_connected_grace_ms: 5_000,
            reconnect_pause_ms: 500,
            quit_flush_ms: 250,
        }
    }
}

impl SessionConfig {
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            limit: self.message_limit,
            window: Duration::from_millis(self.window_ms),
        }
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_millis(self.reminder_interval_ms)
    }

    pub fn not_connected_grace(&self) -> Duration {
        Duration::from_millis(self.not_connected_grace_ms)
    }

    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }

    pub fn quit_flush(&self) -> Duration {
        Duration::from_millis(self.quit_flush_ms)
    }
}

/// Shared, live-reloadable handle to a [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    inner: Arc<RwLock<SessionConfig>>,
}

impl LiveConfig {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> SessionConfig {
        self.inner.read().clone()
    }

    pub fn replace(&self, config: SessionConfig) {
        *self.inner.write() = config;
    }

    pub fn message_limit(&self) -> f64 {
        self.inner.read().message_limit
    }

    pub fn set_message_limit(&self, limit: f64) {
        self.inner.write().message_limit = limit;
    }

    pub fn rate_policy(&self) -> RatePolicy {
        self.inner.read().rate_policy()
    }

    pub fn reminder_interval(&self) -> Duration {
        self.inner.read().reminder_interval()
    }

    pub fn not_connected_grace(&self) -> Duration {
        self.inner.read().not_connected_grace()
    }

    pub fn reconnect_pause(&self) -> Duration {
        self.inner.read().reconnect_pause()
    }

    pub fn quit_flush(&self) -> Duration {
        self.inner.read().quit_flush()
    }
}
