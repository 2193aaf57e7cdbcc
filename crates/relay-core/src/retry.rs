//! Broker reconnect policy.
//!
//! The policy is a plain value handed to the transport when a session is
//! opened. It carries the whole retry schedule so the transport never has to
//! consult global state:
//!
//! - [`ReconnectPolicy::delay_for`]: delay before a given attempt
//! - [`ReconnectPolicy::is_exhausted`]: whether another attempt is allowed

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default delay between reconnect attempts in milliseconds.
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 1000;
/// Default ceiling on the delay between attempts in milliseconds.
pub const DEFAULT_MAX_RETRY_PERIOD_MS: u64 = 30_000;
/// Default backoff multiplier (1 = fixed period).
pub const DEFAULT_MULTIPLIER: u32 = 1;
/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
/// Default number of consecutive failed attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Retry schedule for a broker transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_retry_period_ms")]
    pub retry_period_ms: u64,
    /// Upper bound on the delay once the multiplier kicks in.
    #[serde(default = "default_max_retry_period_ms")]
    pub max_retry_period_ms: u64,
    /// Growth factor per attempt. `1` keeps the period fixed.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Bound on a single connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Consecutive failed attempts allowed before the session is closed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_retry_period_ms() -> u64 {
    DEFAULT_RETRY_PERIOD_MS
}
fn default_max_retry_period_ms() -> u64 {
    DEFAULT_MAX_RETRY_PERIOD_MS
}
fn default_multiplier() -> u32 {
    DEFAULT_MULTIPLIER
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_period_ms: DEFAULT_RETRY_PERIOD_MS,
            max_retry_period_ms: DEFAULT_MAX_RETRY_PERIOD_MS,
            multiplier: DEFAULT_MULTIPLIER,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect attempt `attempt` (1-based).
    ///
    /// `retry_period * multiplier^(attempt-1)`, capped at `max_retry_period`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let ms = self
            .retry_period_ms
            .saturating_mul(factor)
            .min(self.max_retry_period_ms.max(self.retry_period_ms));
        Duration::from_millis(ms)
    }

    /// Whether `failed_attempts` consecutive failures use up the policy.
    ///
    /// A `max_attempts` of zero is clamped to one attempt.
    #[must_use]
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts.max(1)
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
