//! Embedded key-value store with etcd semantics.
//!
//! Keeps a single global revision, lease-bound keys, and a bounded change
//! history so watches can resume from a past revision. Lease deadlines run on
//! the tokio clock, which lets tests drive expiry with paused time.
//!
//! Fault injection:
//! - [`MemoryBackend::set_available`] makes every RPC answer `Unavailable`
//! - [`MemoryBackend::fail_watches`] pushes an error into every open watch
//! - [`MemoryBackend::reject_watches`] makes new watches answer a status
//! - [`MemoryBackend::expire_lease`] drops a lease as if its ttl ran out

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tonic::Status;
use tracing::debug;
use tracing::trace;

use super::EventKind;
use super::KeyEvent;
use super::KvBackend;
use super::RangeSnapshot;
use super::StoreResult;
use super::WatchBatch;
use super::WatchControl;
use super::WatchStream;

const HISTORY_LIMIT: usize = 4096;
const WATCH_CHANNEL_CAPACITY: usize = 4096;
const REAP_INTERVAL: Duration = Duration::from_millis(100);
const FIRST_LEASE_ID: i64 = 0x7f00_0000;

#[derive(Debug)]
struct StoredValue {
    value: Vec<u8>,
    lease_id: Option<i64>,
}

#[derive(Debug)]
struct MemoryLease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    revision: i64,
    compacted_revision: i64,
    data: BTreeMap<String, StoredValue>,
    leases: HashMap<i64, MemoryLease>,
    next_lease_id: i64,
    history: VecDeque<WatchBatch>,
}

impl MemoryState {
    /// Commit `events` as one revision and record it in the history
    fn commit(
        &mut self,
        events: Vec<KeyEvent>,
    ) -> Option<WatchBatch> {
        if events.is_empty() {
            return None;
        }
        self.revision += 1;
        let batch = WatchBatch {
            revision: self.revision,
            events,
        };
        self.history.push_back(batch.clone());
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted_revision = dropped.revision;
            }
        }
        Some(batch)
    }

    fn remove_lease(
        &mut self,
        lease_id: i64,
    ) -> Option<Vec<KeyEvent>> {
        let lease = self.leases.remove(&lease_id)?;
        let mut events = Vec::with_capacity(lease.keys.len());
        for key in lease.keys {
            let bound = self.data.get(&key).is_some_and(|v| v.lease_id == Some(lease_id));
            if bound {
                self.data.remove(&key);
                events.push(KeyEvent {
                    kind: EventKind::Delete,
                    key,
                });
            }
        }
        Some(events)
    }

    fn expired_leases(
        &self,
        now: Instant,
    ) -> Vec<i64> {
        self.leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Debug)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<StoreResult<WatchBatch>>,
    available: AtomicBool,
    watch_rejection: Mutex<Option<Status>>,
}

impl MemoryInner {
    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Status::unavailable("memory store is unavailable"))
        }
    }

    fn publish(
        &self,
        state: &mut MemoryState,
        events: Vec<KeyEvent>,
    ) {
        if let Some(batch) = state.commit(events) {
            trace!(revision = batch.revision, events = batch.events.len(), "memory store commit");
            // No receivers simply means nobody is watching.
            let _ = self.events.send(Ok(batch));
        }
    }

    /// Drop every lease whose deadline has passed, deleting its keys
    fn reap(&self) {
        let mut state = self.state.lock();
        self.reap_locked(&mut state);
    }

    fn reap_locked(
        &self,
        state: &mut MemoryState,
    ) {
        let now = Instant::now();
        for lease_id in state.expired_leases(now) {
            if let Some(events) = state.remove_lease(lease_id) {
                debug!(lease_id, keys = events.len(), "memory store lease expired");
                self.publish(state, events);
            }
        }
    }
}

/// Strongly consistent in-process store
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty store. When called inside a tokio runtime a background
    /// task also expires leases that nobody touches.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let inner = Arc::new(MemoryInner {
            state: Mutex::new(MemoryState {
                next_lease_id: FIRST_LEASE_ID,
                ..Default::default()
            }),
            events,
            available: AtomicBool::new(true),
            watch_rejection: Mutex::new(None),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            handle.spawn(reap_expired_leases(weak));
        }

        Self { inner }
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_available(
        &self,
        available: bool,
    ) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Push `status` into every open watch stream
    pub fn fail_watches(
        &self,
        status: Status,
    ) {
        let _ = self.inner.events.send(Err(status));
    }

    /// Answer every new watch with `status` until called again with `None`
    pub fn reject_watches(
        &self,
        status: Option<Status>,
    ) {
        *self.inner.watch_rejection.lock() = status;
    }

    /// Expire a lease immediately, deleting the keys bound to it
    pub fn expire_lease(
        &self,
        lease_id: i64,
    ) -> bool {
        let mut state = self.inner.state.lock();
        match state.remove_lease(lease_id) {
            Some(events) => {
                self.inner.publish(&mut state, events);
                true
            }
            None => false,
        }
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Ids of leases that are still alive
    pub fn lease_ids(&self) -> Vec<i64> {
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);
        let mut ids: Vec<i64> = state.leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Value stored under `key`
    pub fn value(
        &self,
        key: &str,
    ) -> Option<Vec<u8>> {
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);
        state.data.get(key).map(|v| v.value.clone())
    }

    /// Lease bound to `key`, if any
    pub fn key_lease(
        &self,
        key: &str,
    ) -> Option<i64> {
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);
        state.data.get(key).and_then(|v| v.lease_id)
    }
}

async fn reap_expired_leases(inner: Weak<MemoryInner>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        match inner.upgrade() {
            Some(inner) => inner.reap(),
            None => break,
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> StoreResult<i64> {
        self.inner.check_available()?;
        if ttl_secs <= 0 {
            return Err(Status::invalid_argument("lease ttl must be positive"));
        }

        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);

        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        let ttl = Duration::from_secs(ttl_secs as u64);
        state.leases.insert(
            lease_id,
            MemoryLease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease_id, ttl_secs, "memory store lease granted");
        Ok(lease_id)
    }

    async fn keep_alive_once(
        &self,
        lease_id: i64,
    ) -> StoreResult<i64> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);

        match state.leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.deadline = Instant::now() + lease.ttl;
                Ok(lease.ttl.as_secs() as i64)
            }
            None => Err(Status::not_found("requested lease not found")),
        }
    }

    async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> StoreResult<()> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);

        match state.remove_lease(lease_id) {
            Some(events) => {
                self.inner.publish(&mut state, events);
                Ok(())
            }
            None => Err(Status::not_found("requested lease not found")),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_id: Option<i64>,
    ) -> StoreResult<()> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);

        if let Some(id) = lease_id {
            match state.leases.get_mut(&id) {
                Some(lease) => {
                    lease.keys.insert(key.to_string());
                }
                None => return Err(Status::not_found("requested lease not found")),
            }
        }

        let previous = state.data.insert(key.to_string(), StoredValue { value, lease_id });
        if let Some(old_lease) = previous.and_then(|v| v.lease_id) {
            if Some(old_lease) != lease_id {
                if let Some(lease) = state.leases.get_mut(&old_lease) {
                    lease.keys.remove(key);
                }
            }
        }

        self.inner.publish(
            &mut state,
            vec![KeyEvent {
                kind: EventKind::Put,
                key: key.to_string(),
            }],
        );
        Ok(())
    }

    async fn exists(
        &self,
        key: &str,
    ) -> StoreResult<bool> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);
        Ok(state.data.contains_key(key))
    }

    async fn range_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<RangeSnapshot> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);

        let keys = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(RangeSnapshot {
            revision: state.revision,
            keys,
        })
    }

    async fn delete(
        &self,
        key: &str,
    ) -> StoreResult<()> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        self.inner.reap_locked(&mut state);

        if let Some(removed) = state.data.remove(key) {
            if let Some(lease) = removed.lease_id.and_then(|id| state.leases.get_mut(&id)) {
                lease.keys.remove(key);
            }
            self.inner.publish(
                &mut state,
                vec![KeyEvent {
                    kind: EventKind::Delete,
                    key: key.to_string(),
                }],
            );
        }
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> StoreResult<WatchStream> {
        self.inner.check_available()?;
        if let Some(status) = self.inner.watch_rejection.lock().clone() {
            return Err(status);
        }

        // Subscribe under the state lock so that nothing committed between the
        // history replay and the live feed is lost or duplicated.
        let (replay, receiver) = {
            let mut state = self.inner.state.lock();
            self.inner.reap_locked(&mut state);
            let receiver = self.inner.events.subscribe();

            let mut replay: Vec<StoreResult<WatchBatch>> = Vec::new();
            if start_revision > 0 && start_revision <= state.compacted_revision {
                replay.push(Err(Status::unavailable("required revision has been compacted")));
            } else {
                replay.extend(
                    state
                        .history
                        .iter()
                        .filter(|batch| batch.revision >= start_revision)
                        .filter_map(|batch| filter_batch(batch, prefix))
                        .map(Ok),
                );
            }
            (replay, receiver)
        };

        let token = CancellationToken::new();
        let owned_prefix = prefix.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let out = match item {
                Ok(Ok(batch)) => {
                    if batch.revision < start_revision {
                        None
                    } else {
                        filter_batch(&batch, &owned_prefix).map(Ok)
                    }
                }
                Ok(Err(status)) => Some(Err(status)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(Status::unavailable(format!(
                    "watch stream lagged behind by {skipped} batches"
                )))),
            };
            futures::future::ready(out)
        });

        let events = futures::stream::iter(replay)
            .chain(live)
            .take_until(token.clone().cancelled_owned())
            .boxed();

        Ok(WatchStream {
            control: Box::new(MemoryWatchControl {
                token,
                inner: Arc::downgrade(&self.inner),
            }),
            events,
        })
    }

    fn is_connected(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    async fn close(&self) {
        // The embedded store outlives its clients; closing a client only drops its handle.
        trace!("memory store client closed");
    }
}

fn filter_batch(
    batch: &WatchBatch,
    prefix: &str,
) -> Option<WatchBatch> {
    let events: Vec<KeyEvent> = batch
        .events
        .iter()
        .filter(|e| e.key.starts_with(prefix))
        .cloned()
        .collect();
    if events.is_empty() {
        None
    } else {
        Some(WatchBatch {
            revision: batch.revision,
            events,
        })
    }
}

struct MemoryWatchControl {
    token: CancellationToken,
    inner: Weak<MemoryInner>,
}

#[async_trait]
impl WatchControl for MemoryWatchControl {
    async fn request_progress(&mut self) -> StoreResult<()> {
        if self.token.is_cancelled() {
            return Err(Status::cancelled("call was cancelled"));
        }
        match self.inner.upgrade() {
            Some(inner) => inner.check_available(),
            None => Err(Status::unavailable("memory store dropped")),
        }
    }

    async fn cancel(&mut self) -> StoreResult<()> {
        self.token.cancel();
        Ok(())
    }
}
