use std::sync::Arc;
use std::time::Duration;

use super::ClientInner;
use super::EtcdClient;
use crate::keystore::KeyStore;
use crate::lease::BackendKeepAlive;
use crate::lease::KeepAliveStrategy;
use crate::lease::LeaseManager;
use crate::store::EtcdBackend;
use crate::store::KvBackend;
use crate::watch::WatchManager;
use crate::RegistryConfig;
use crate::Result;

pub struct ClientBuilder {
    config: RegistryConfig,
    backend: Option<Arc<dyn KvBackend>>,
    keep_alive: Option<Arc<dyn KeepAliveStrategy>>,
}

impl ClientBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            backend: None,
            keep_alive: None,
        }
    }

    /// Use `backend` instead of connecting to the configured etcd endpoints
    pub fn backend(
        mut self,
        backend: Arc<dyn KvBackend>,
    ) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the keepalive round-trip (default: one keepalive RPC per tick)
    pub fn keep_alive_strategy(
        mut self,
        strategy: Arc<dyn KeepAliveStrategy>,
    ) -> Self {
        self.keep_alive = Some(strategy);
        self
    }

    /// Set the session timeout that drives the session lease ttl (default: 60s)
    pub fn session_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.lease.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set request timeout (default: 3s)
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the number of notify workers (default: cores + 1, at most 32)
    pub fn notify_threads(
        mut self,
        threads: usize,
    ) -> Self {
        self.config.watch.notify_threads = threads;
        self
    }

    /// Completely replaces the configuration, discarding earlier setter calls
    pub fn set_config(
        mut self,
        config: RegistryConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Build the client with current configuration
    pub async fn build(self) -> Result<EtcdClient> {
        self.config.validate()?;

        let backend: Arc<dyn KvBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(EtcdBackend::connect(&self.config).await?),
        };
        let keep_alive = self
            .keep_alive
            .unwrap_or_else(|| Arc::new(BackendKeepAlive::new(backend.clone())));

        let leases = Arc::new(LeaseManager::new(
            backend.clone(),
            keep_alive,
            self.config.lease.clone(),
            self.config.request_timeout(),
        ));
        let keys = Arc::new(KeyStore::new(
            backend.clone(),
            leases.clone(),
            self.config.request_timeout(),
        ));
        let watches = WatchManager::new(keys.clone(), backend.clone(), self.config.watch.clone())?;

        Ok(EtcdClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                backend,
                leases,
                keys,
                watches,
                closed: Default::default(),
            }),
        })
    }
}
