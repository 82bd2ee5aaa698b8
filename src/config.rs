//! Per-component tuning knobs.
//!
//! Defaults reproduce the upstream timings (1 s aggregator reconnect, 1 s
//! then 8 s uplink retry, unbounded retries, no request timeout); the extra
//! fields exist so deployments can bound the blocking behaviours.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Delay between reconnect attempts for one worker.
    pub reconnect_delay_ms: u64,
    /// How often a blocked read re-checks the interrupt and the
    /// subscription frontier.
    pub poll_interval_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1_000,
            poll_interval_ms: 100,
        }
    }
}

impl AggregatorConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Delay before the first retry of a failed send.
    pub initial_retry_delay_ms: u64,
    /// Delay before every subsequent retry.
    pub retry_delay_ms: u64,
    /// Retry budget for one send. `None` retries forever; callers rely on
    /// sends never being dropped, so only bound this deliberately.
    pub max_retries: Option<u32>,
    pub poll_interval_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 1_000,
            retry_delay_ms: 8_000,
            max_retries: None,
            poll_interval_ms: 100,
        }
    }
}

impl UplinkConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub connect_timeout_ms: u64,
    /// Bound on a single `get()`/`next()` wait. `None` preserves the
    /// upstream block-forever behaviour.
    pub request_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: None,
            poll_interval_ms: 100,
        }
    }
}

impl MuxConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
