use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use etcd_client::Client;
use etcd_client::ConnectOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::PutOptions;
use etcd_client::WatchOptions;
use futures::StreamExt;
use tonic::async_trait;
use tonic::Code;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::EventKind;
use super::KeyEvent;
use super::KvBackend;
use super::RangeSnapshot;
use super::StoreResult;
use super::WatchBatch;
use super::WatchControl;
use super::WatchStream;
use crate::Error;
use crate::RegistryConfig;
use crate::Result;

/// etcd v3 backend
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for EtcdBackend {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdBackend")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl EtcdBackend {
    /// Connect to the endpoints named in `config`
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_timeout(config.request_timeout())
            .with_connect_timeout(config.connect_timeout())
            .with_keep_alive_while_idle(true);

        let client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| Error::from_status("connect", to_status(e)))?;

        info!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self {
            client,
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    fn track<T>(
        &self,
        result: std::result::Result<T, etcd_client::Error>,
    ) -> StoreResult<T> {
        match result {
            Ok(value) => {
                self.connected.store(true, Ordering::Release);
                Ok(value)
            }
            Err(e) => {
                let status = to_status(e);
                if status.code() == Code::Unavailable {
                    self.connected.store(false, Ordering::Release);
                }
                Err(status)
            }
        }
    }
}

fn to_status(error: etcd_client::Error) -> Status {
    match error {
        etcd_client::Error::GRpcStatus(status) => status,
        other => Status::unavailable(other.to_string()),
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let response = self.track(client.lease_grant(ttl_secs, None).await)?;
        Ok(response.id())
    }

    async fn keep_alive_once(
        &self,
        lease_id: i64,
    ) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = self.track(client.lease_keep_alive(lease_id).await)?;
        self.track(keeper.keep_alive().await)?;

        match self.track(stream.message().await)? {
            // etcd answers ttl 0 for a lease it no longer knows
            Some(response) if response.ttl() > 0 => Ok(response.ttl()),
            Some(_) => Err(Status::not_found("requested lease not found")),
            None => Err(Status::unavailable("keepalive stream closed")),
        }
    }

    async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> StoreResult<()> {
        let mut client = self.client.clone();
        self.track(client.lease_revoke(lease_id).await)?;
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_id: Option<i64>,
    ) -> StoreResult<()> {
        let mut client = self.client.clone();
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        self.track(client.put(key, value, options).await)?;
        Ok(())
    }

    async fn exists(
        &self,
        key: &str,
    ) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let response = self.track(client.get(key, Some(GetOptions::new().with_count_only())).await)?;
        Ok(response.count() > 0)
    }

    async fn range_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<RangeSnapshot> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix().with_keys_only();
        let response = self.track(client.get(prefix, Some(options)).await)?;

        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
        let mut keys = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match kv.key_str() {
                Ok(key) => keys.push(key.to_string()),
                Err(e) => warn!(error = %e, "skipping non utf-8 key under {prefix}"),
            }
        }
        Ok(RangeSnapshot { revision, keys })
    }

    async fn delete(
        &self,
        key: &str,
    ) -> StoreResult<()> {
        let mut client = self.client.clone();
        self.track(client.delete(key, None).await)?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision)
            .with_progress_notify();
        let (watcher, stream) = self.track(client.watch(prefix, Some(options)).await)?;
        debug!(prefix, start_revision, watch_id = watcher.watch_id(), "etcd watch opened");

        let events = futures::stream::unfold(Some(stream), |state| async move {
            let mut stream = state?;
            match stream.message().await {
                Ok(Some(response)) => {
                    if response.canceled() {
                        let reason = response.cancel_reason().to_string();
                        return Some((Err(Status::aborted(reason)), None));
                    }
                    if response.compact_revision() > 0 {
                        return Some((Err(Status::unavailable("required revision has been compacted")), None));
                    }
                    let revision = response.header().map(|h| h.revision()).unwrap_or_default();
                    let events = response
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let key = event.kv()?.key_str().ok()?.to_string();
                            let kind = match event.event_type() {
                                EventType::Put => EventKind::Put,
                                EventType::Delete => EventKind::Delete,
                            };
                            Some(KeyEvent { kind, key })
                        })
                        .collect();
                    Some((Ok(WatchBatch { revision, events }), Some(stream)))
                }
                Ok(None) => None,
                Err(e) => Some((Err(to_status(e)), None)),
            }
        })
        .boxed();

        Ok(WatchStream {
            control: Box::new(EtcdWatchControl { watcher }),
            events,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        debug!("etcd backend closed");
    }
}

struct EtcdWatchControl {
    watcher: etcd_client::Watcher,
}

#[async_trait]
impl WatchControl for EtcdWatchControl {
    async fn request_progress(&mut self) -> StoreResult<()> {
        self.watcher.request_progress().await.map_err(to_status)
    }

    async fn cancel(&mut self) -> StoreResult<()> {
        self.watcher.cancel().await.map_err(to_status)
    }
}
