//! Transport seam between the registry client and the key-value store.
//!
//! [`KvBackend`] is the narrow set of RPCs the client needs: leases, single-key
//! writes, prefix listing, and prefix watches. Every call answers with a
//! [`tonic::Status`] on failure so that callers can classify transport errors
//! the same way regardless of the backend.
//!
//! Two implementations are provided:
//! - [`EtcdBackend`]: etcd v3 through `etcd-client`
//! - [`MemoryBackend`]: an embedded, strongly consistent store used for
//!   development and tests, with fault injection hooks

mod etcd;
mod memory;

pub use etcd::*;
pub use memory::*;

#[cfg(test)]
mod memory_test;

use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;
use tonic::async_trait;
use tonic::Status;

pub type StoreResult<T> = std::result::Result<T, Status>;

/// Kind of a single key change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub kind: EventKind,
    pub key: String,
}

/// One server-pushed batch of changes, all committed at `revision`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<KeyEvent>,
}

/// Keys under a prefix, read at a single store revision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSnapshot {
    pub revision: i64,
    pub keys: Vec<String>,
}

pub type WatchEvents = BoxStream<'static, StoreResult<WatchBatch>>;

/// Request side of a live watch stream
#[async_trait]
pub trait WatchControl: Send + Sync {
    /// Send the next request on the stream (a progress request)
    async fn request_progress(&mut self) -> StoreResult<()>;

    /// Cancel the stream server side
    async fn cancel(&mut self) -> StoreResult<()>;
}

/// A bidirectional watch: the request half plus the event half
pub struct WatchStream {
    pub control: Box<dyn WatchControl>,
    pub events: WatchEvents,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Grant a lease with the given ttl, returning its id
    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> StoreResult<i64>;

    /// Renew a lease once, returning the remaining ttl.
    /// An unknown or expired lease answers `NotFound`.
    async fn keep_alive_once(
        &self,
        lease_id: i64,
    ) -> StoreResult<i64>;

    async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> StoreResult<()>;

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_id: Option<i64>,
    ) -> StoreResult<()>;

    async fn exists(
        &self,
        key: &str,
    ) -> StoreResult<bool>;

    /// Every key starting with `prefix`, in key order
    async fn range_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<RangeSnapshot>;

    /// Delete a single key; deleting a missing key succeeds
    async fn delete(
        &self,
        key: &str,
    ) -> StoreResult<()>;

    /// Watch every key starting with `prefix`, from `start_revision` onwards
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> StoreResult<WatchStream>;

    /// Whether the last interaction with the store succeeded
    fn is_connected(&self) -> bool;

    async fn close(&self);
}
