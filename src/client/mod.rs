//! Client module for the registry store
//!
//! Provides the components that talk to the store:
//! - [`EtcdClient`] - Main entry point bundling the managers below
//! - [`ClientBuilder`] - Configurable client construction
//! - [`LeaseManager`] - Session lease and keepalive
//! - [`KeyStore`] - Persistent and ephemeral keys, child listing
//! - [`WatchManager`] - Child watches and listener dispatch
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use etcd_registry::{ChildListener, EtcdClient, Url};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let url: Url = "etcd3://127.0.0.1:2379/registry?session-timeout=15000"
//!         .parse()
//!         .unwrap();
//!     let client = EtcdClient::connect(&url).await.unwrap();
//!
//!     client.create_ephemeral("/dubbo/demo/providers/node-1").await.unwrap();
//!
//!     let listener: ChildListener = Arc::new(|path: &str, children: &[String]| {
//!         println!("{path}: {children:?}");
//!     });
//!     let current = client
//!         .add_child_listener("/dubbo/demo/providers", listener)
//!         .await
//!         .unwrap();
//!     println!("current providers: {current:?}");
//!
//!     client.close().await;
//! }
//! ```

mod builder;

pub use builder::*;


use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::keystore::KeyStore;
use crate::lease::LeaseManager;
use crate::store::KvBackend;
use crate::watch::ChildListener;
use crate::watch::WatchManager;
use crate::watch::WatcherHandle;
use crate::RegistryConfig;
use crate::Result;
use crate::Url;

/// Handle to one store session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct EtcdClient {
    pub(super) inner: Arc<ClientInner>,
}

pub(super) struct ClientInner {
    pub(super) config: RegistryConfig,
    pub(super) backend: Arc<dyn KvBackend>,
    pub(super) leases: Arc<LeaseManager>,
    pub(super) keys: Arc<KeyStore>,
    pub(super) watches: WatchManager,
    pub(super) closed: AtomicBool,
}

impl std::fmt::Debug for EtcdClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdClient")
            .field("endpoints", &self.inner.config.endpoints)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl EtcdClient {
    /// Create a configured client builder
    pub fn builder(config: RegistryConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Connect to the etcd cluster named by the locator
    /// (`etcd3://host:port?backup=...&session-timeout=...`)
    pub async fn connect(url: &Url) -> Result<Self> {
        let config = RegistryConfig::from_url(url)?;
        ClientBuilder::new(config).build().await
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.inner.leases
    }

    pub fn keys(&self) -> &KeyStore {
        &self.inner.keys
    }

    pub fn watches(&self) -> &WatchManager {
        &self.inner.watches
    }

    pub async fn create_persistent(
        &self,
        path: &str,
    ) -> Result<()> {
        self.inner.keys.create_persistent(path).await
    }

    pub async fn create_ephemeral(
        &self,
        path: &str,
    ) -> Result<()> {
        self.inner.keys.create_ephemeral(path).await
    }

    pub async fn check_exists(
        &self,
        path: &str,
    ) -> Result<bool> {
        self.inner.keys.check_exists(path).await
    }

    pub async fn get_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        Ok(self.inner.keys.get_children(path).await?.children)
    }

    pub async fn delete(
        &self,
        path: &str,
    ) -> Result<()> {
        self.inner.keys.delete(path).await
    }

    pub async fn add_child_listener(
        &self,
        path: &str,
        listener: ChildListener,
    ) -> Result<Vec<String>> {
        self.inner.watches.add_child_listener(path, listener).await
    }

    pub async fn remove_child_listener(
        &self,
        path: &str,
        listener: &ChildListener,
    ) {
        self.inner.watches.remove_child_listener(path, listener).await
    }

    pub async fn get_child_listener(
        &self,
        path: &str,
        listener: &ChildListener,
    ) -> Option<WatcherHandle> {
        self.inner.watches.get_child_listener(path, listener).await
    }

    /// Whether the client is open and the store answered its last call
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.inner.backend.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close watches first so no listener fires, then revoke the session
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.watches.close().await;
        self.inner.keys.close();
        self.inner.leases.close().await;
        self.inner.backend.close().await;
        info!("registry client closed");
    }
}
