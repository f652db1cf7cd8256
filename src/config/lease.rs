use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_MAX_KEEPALIVE_FAILURES;
use crate::constants::DEFAULT_SESSION_TIMEOUT_MS;
use crate::Error;
use crate::Result;

/// Session lease parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LeaseConfig {
    /// Session timeout in milliseconds, used as the session lease ttl
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Keepalive period in milliseconds. Defaults to half the session timeout
    /// and is never allowed above half the lease ttl.
    #[serde(default)]
    pub keepalive_interval_ms: Option<u64>,

    /// Consecutive keepalive failures after which a lease is considered expired
    #[serde(default = "default_max_keepalive_failures")]
    pub max_keepalive_failures: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            keepalive_interval_ms: None,
            max_keepalive_failures: default_max_keepalive_failures(),
        }
    }
}

impl LeaseConfig {
    /// Session lease ttl in whole seconds (the store's granularity), at least 1
    pub fn session_ttl_secs(&self) -> i64 {
        ((self.session_timeout_ms / 1000) as i64).max(1)
    }

    /// Effective keepalive period for a lease of `ttl_secs`
    pub fn keepalive_interval(
        &self,
        ttl_secs: i64,
    ) -> Duration {
        let half_ttl_ms = (ttl_secs.max(1) as u64) * 1000 / 2;
        let configured = self.keepalive_interval_ms.unwrap_or(self.session_timeout_ms / 2);
        Duration::from_millis(configured.clamp(1, half_ttl_ms.max(1)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "session timeout must be > 0".into(),
            )));
        }

        if self.keepalive_interval_ms == Some(0) {
            return Err(Error::Config(ConfigError::Message(
                "keepalive interval must be > 0".into(),
            )));
        }

        if self.max_keepalive_failures == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max keepalive failures must be >= 1".into(),
            )));
        }

        Ok(())
    }
}

fn default_session_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}
fn default_max_keepalive_failures() -> u32 {
    DEFAULT_MAX_KEEPALIVE_FAILURES
}
