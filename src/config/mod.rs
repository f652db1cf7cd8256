//! Configuration management for the registry client.
//!
//! Provides layered configuration loading with priority:
//! 1. Default values (hardcoded)
//! 2. Config file (explicit path, or `CONFIG_PATH`)
//! 3. Environment variables prefixed `REGISTRY__` (highest priority)
//!
//! The connection locator (`etcd3://host:port/...?session-timeout=...`) is
//! applied on top with [`RegistryConfig::with_url`].

mod lease;
mod retry;
mod watch;
pub use lease::*;
pub use retry::*;
pub use watch::*;


//---
use std::env;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::constants::DEFAULT_ROOT;
use crate::constants::GROUP_KEY;
use crate::constants::HTTP_KEY;
use crate::constants::HTTP_SUBFIX_KEY;
use crate::constants::NOTIFY_MAXTHREADS_KEY;
use crate::constants::NOTIFY_QUEUES_KEY;
use crate::constants::SESSION_TIMEOUT_KEY;
use crate::Error;
use crate::Result;
use crate::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Root node of the registry key space
    #[serde(default = "default_root")]
    pub root: String,

    /// Store endpoints; every entry is tried for client-side failover
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Upper bound for a single store round-trip (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Upper bound for establishing the store connection (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    /// Retry policy used when re-registering after a session expiry
    #[serde(default)]
    pub recovery: BackoffPolicy,

    /// Re-create registrations automatically when the session lease expires
    #[serde(default = "default_recover_on_expiry")]
    pub recover_on_expiry: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            endpoints: default_endpoints(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            lease: LeaseConfig::default(),
            watch: WatchConfig::default(),
            recovery: BackoffPolicy::default(),
            recover_on_expiry: default_recover_on_expiry(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from file and environment.
    ///
    /// # Arguments
    /// * `config_path` - Optional TOML file; falls back to `CONFIG_PATH`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        } else if let Ok(path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("REGISTRY")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the connection locator
    pub fn from_url(url: &Url) -> Result<Self> {
        Self::default().with_url(url)
    }

    /// Overlay the connection locator:
    /// `etcd3://host:port[,...]/<path>?backup=...&session-timeout=<ms>`
    pub fn with_url(
        mut self,
        url: &Url,
    ) -> Result<Self> {
        if url.host().is_empty() {
            return Err(Error::InvalidUrl {
                url: url.to_full_string(),
                reason: "registry address is empty".into(),
            });
        }

        self.endpoints = url
            .backup_addresses()
            .into_iter()
            .map(|address| {
                if address.contains(HTTP_SUBFIX_KEY) {
                    address
                } else {
                    format!("{HTTP_KEY}{address}")
                }
            })
            .collect();

        if let Some(timeout) = parse_parameter::<u64>(url, SESSION_TIMEOUT_KEY)? {
            self.lease.session_timeout_ms = timeout;
        }
        if let Some(threads) = parse_parameter::<usize>(url, NOTIFY_MAXTHREADS_KEY)? {
            self.watch.notify_threads = threads;
        }
        if let Some(queues) = parse_parameter::<usize>(url, NOTIFY_QUEUES_KEY)? {
            self.watch.notify_queue_size = queues;
        }
        if let Some(group) = url.parameter(GROUP_KEY) {
            self.root = group.trim_matches('/').to_string();
        }

        self.validate()?;
        Ok(self)
    }

    /// `/<root>`
    pub fn root_dir(&self) -> String {
        format!("/{}", self.root.trim_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.trim_matches('/').is_empty() {
            return Err(Error::Config(ConfigError::Message("root must not be empty".into())));
        }

        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "at least one endpoint is required".into(),
            )));
        }

        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "request and connect timeouts must be > 0".into(),
            )));
        }

        self.lease.validate()?;
        self.watch.validate()?;

        Ok(())
    }
}

fn parse_parameter<T: std::str::FromStr>(
    url: &Url,
    key: &str,
) -> Result<Option<T>> {
    match url.parameter(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| Error::InvalidUrl {
            url: url.to_full_string(),
            reason: format!("parameter '{key}' has invalid value '{raw}'"),
        }),
        None => Ok(None),
    }
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}
fn default_endpoints() -> Vec<String> {
    vec![format!("{HTTP_KEY}127.0.0.1:2379")]
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_recover_on_expiry() -> bool {
    true
}
