use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::default_notify_threads;
use crate::constants::DEFAULT_NOTIFY_QUEUES;
use crate::constants::DEFAULT_RECONNECT_BASE_DELAY_MS;
use crate::constants::DEFAULT_RECONNECT_MAX_DELAY_MS;
use crate::Error;
use crate::Result;

/// Watch streams and listener dispatch
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Number of notify workers that run listener callbacks
    #[serde(default = "default_notify_threads")]
    pub notify_threads: usize,

    /// Total queue depth shared by the notify workers
    #[serde(default = "default_notify_queue_size")]
    pub notify_queue_size: usize,

    /// First delay before re-establishing a recoverable stream (ms)
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for the reconnect backoff (ms)
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            notify_threads: default_notify_threads(),
            notify_queue_size: default_notify_queue_size(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl WatchConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.notify_threads == 0 {
            return Err(Error::Config(ConfigError::Message(
                "notify threads must be > 0".into(),
            )));
        }

        if self.notify_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "notify queue size must be > 0".into(),
            )));
        }

        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "reconnect base delay {}ms exceeds max delay {}ms",
                self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
            ))));
        }

        Ok(())
    }
}

fn default_notify_queue_size() -> usize {
    DEFAULT_NOTIFY_QUEUES
}
fn default_reconnect_base_delay_ms() -> u64 {
    DEFAULT_RECONNECT_BASE_DELAY_MS
}
fn default_reconnect_max_delay_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}
