//! Engine configuration.
//!
//! All fields have defaults, so hosts can deserialize a partial document (or
//! nothing at all) and only override what they need.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Budget for one SendAndWait round-trip.
    pub send_and_wait_timeout_ms: u64,
    pub lock: LockConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_and_wait_timeout_ms: 90_000,
            lock: LockConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn send_and_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.send_and_wait_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    /// Lease of an acquired lock. Also the upper bound for one locked run.
    pub ttl_ms: u64,
    pub acquire_retries: u32,
    pub retry_delay_ms: u64,
    /// Upper bound of the random delay added to each acquire retry.
    pub retry_jitter_ms: u64,
    pub release_retries: u32,
    pub release_retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            acquire_retries: 20,
            retry_delay_ms: 500,
            retry_jitter_ms: 200,
            release_retries: 30,
            release_retry_delay_ms: 500,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn release_retry_delay(&self) -> Duration {
        Duration::from_millis(self.release_retry_delay_ms)
    }
}
