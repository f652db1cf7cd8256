//! Lease lifecycle: grant, periodic keepalive, expiry detection, revoke.
//!
//! Every granted lease gets its own keepalive task, so a failing lease never
//! delays the renewal of another one. After `max_keepalive_failures`
//! consecutive misses a lease is marked [`LeaseState::Expired`] and its id is
//! published on [`LeaseManager::subscribe_expired`]. The manager stops
//! renewing and forgets the lease at that point, leaving the store's own ttl to
//! drop it; it never re-creates a lease on its own.
//!
//! # Concurrency Model
//! - Lease table: `DashMap`, read from the registry and written by keepalive tasks
//! - Session lease: guarded by an async mutex so that concurrent callers share one grant


use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tonic::Code;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::KEEPALIVE_FAILURES;
use crate::store::KvBackend;
use crate::Error;
use crate::LeaseConfig;
use crate::Result;

const EXPIRED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Expired,
    Revoked,
}

/// Point-in-time view of a lease
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub ttl_secs: i64,
    pub last_renewed: Instant,
    pub state: LeaseState,
}

/// One lease renewal round-trip.
///
/// Production code renews through the store; tests substitute a failing
/// strategy to drive leases into expiry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeepAliveStrategy: Send + Sync + 'static {
    /// Renew `lease_id` once and return the ttl granted by the store
    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<i64>;
}

/// Renews leases with a single keepalive RPC against the backend
pub struct BackendKeepAlive {
    backend: Arc<dyn KvBackend>,
}

impl BackendKeepAlive {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl KeepAliveStrategy for BackendKeepAlive {
    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<i64> {
        self.backend
            .keep_alive_once(lease_id)
            .await
            .map_err(|status| Error::from_lease_status("keepalive", lease_id, status))
    }
}

struct LeaseEntry {
    lease: Arc<Mutex<Lease>>,
    keepalive: JoinHandle<()>,
}

pub struct LeaseManager {
    backend: Arc<dyn KvBackend>,
    strategy: Arc<dyn KeepAliveStrategy>,
    config: LeaseConfig,
    request_timeout: Duration,

    leases: Arc<DashMap<i64, LeaseEntry>>,
    session: tokio::sync::Mutex<Option<i64>>,
    expired_tx: broadcast::Sender<i64>,

    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("leases", &self.leases.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LeaseManager {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        strategy: Arc<dyn KeepAliveStrategy>,
        config: LeaseConfig,
        request_timeout: Duration,
    ) -> Self {
        let (expired_tx, _) = broadcast::channel(EXPIRED_CHANNEL_CAPACITY);
        Self {
            backend,
            strategy,
            config,
            request_timeout,
            leases: Arc::new(DashMap::new()),
            session: tokio::sync::Mutex::new(None),
            expired_tx,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Grant a lease and start renewing it in the background
    pub async fn create_lease(
        &self,
        ttl_secs: i64,
    ) -> Result<i64> {
        self.ensure_open()?;

        let lease_id = match timeout(self.request_timeout, self.backend.grant_lease(ttl_secs)).await {
            Ok(Ok(id)) => id,
            Ok(Err(status)) => return Err(Error::from_status("grant lease", status)),
            Err(_) => return Err(Error::Timeout(self.request_timeout)),
        };

        let lease = Arc::new(Mutex::new(Lease {
            id: lease_id,
            ttl_secs,
            last_renewed: Instant::now(),
            state: LeaseState::Active,
        }));

        let keepalive = tokio::spawn(run_keepalive(
            lease.clone(),
            self.leases.clone(),
            self.strategy.clone(),
            self.config.keepalive_interval(ttl_secs),
            self.config.max_keepalive_failures,
            self.request_timeout,
            self.expired_tx.clone(),
            self.shutdown.child_token(),
        ));

        self.leases.insert(lease_id, LeaseEntry { lease, keepalive });
        info!(lease_id, ttl_secs, "lease granted");
        Ok(lease_id)
    }

    /// The lease that owns this session's ephemeral keys, granted on first use.
    ///
    /// Once the session lease has expired this keeps failing with
    /// [`Error::LeaseExpired`] until [`Self::renew_session`] is called.
    pub async fn session_lease(&self) -> Result<i64> {
        let mut session = self.session.lock().await;
        match *session {
            Some(id) => match self.lease(id).map(|l| l.state) {
                Some(LeaseState::Active) => Ok(id),
                _ => Err(Error::LeaseExpired(id)),
            },
            None => {
                let id = self.create_lease(self.config.session_ttl_secs()).await?;
                *session = Some(id);
                Ok(id)
            }
        }
    }

    /// Replace an expired session lease with a fresh one.
    /// Returns the current id unchanged if the session lease is still active.
    pub async fn renew_session(&self) -> Result<i64> {
        let mut session = self.session.lock().await;
        if let Some(id) = *session {
            if self.lease(id).map(|l| l.state) == Some(LeaseState::Active) {
                return Ok(id);
            }
            if let Some((_, entry)) = self.leases.remove(&id) {
                entry.keepalive.abort();
            }
        }

        let id = self.create_lease(self.config.session_ttl_secs()).await?;
        *session = Some(id);
        info!(lease_id = id, "session lease renewed");
        Ok(id)
    }

    pub fn lease(
        &self,
        lease_id: i64,
    ) -> Option<Lease> {
        self.leases.get(&lease_id).map(|entry| entry.lease.lock().clone())
    }

    /// Ids of leases whose keepalive gave up
    pub fn subscribe_expired(&self) -> broadcast::Receiver<i64> {
        self.expired_tx.subscribe()
    }

    /// Stop renewing and revoke `lease_id`.
    /// Revoking an expired or unknown lease is a no-op.
    pub async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            if *session == Some(lease_id) {
                *session = None;
            }
        }

        let Some((_, entry)) = self.leases.remove(&lease_id) else {
            debug!(lease_id, "revoke of unknown lease ignored");
            return Ok(());
        };
        entry.keepalive.abort();

        let previous = {
            let mut lease = entry.lease.lock();
            std::mem::replace(&mut lease.state, LeaseState::Revoked)
        };
        if previous != LeaseState::Active {
            debug!(lease_id, "revoke of expired lease ignored");
            return Ok(());
        }

        match timeout(self.request_timeout, self.backend.revoke_lease(lease_id)).await {
            Ok(Ok(())) => {
                info!(lease_id, "lease revoked");
                Ok(())
            }
            Ok(Err(status)) if status.code() == Code::NotFound => Ok(()),
            Ok(Err(status)) => Err(Error::from_lease_status("revoke lease", lease_id, status)),
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }

    /// Cancel every keepalive task, then revoke the active leases best-effort
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let ids: Vec<i64> = self.leases.iter().map(|e| *e.key()).collect();
        for id in &ids {
            if let Some(entry) = self.leases.get(id) {
                entry.keepalive.abort();
            }
        }

        for id in ids {
            let Some((_, entry)) = self.leases.remove(&id) else {
                continue;
            };
            let was_active = {
                let mut lease = entry.lease.lock();
                std::mem::replace(&mut lease.state, LeaseState::Revoked) == LeaseState::Active
            };
            if was_active {
                if let Ok(Err(status)) = timeout(self.request_timeout, self.backend.revoke_lease(id)).await {
                    debug!(lease_id = id, %status, "best-effort revoke on close failed");
                }
            }
        }
        *self.session.lock().await = None;
        debug!("lease manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedClient {
                client: "lease",
                path: String::new(),
            });
        }
        Ok(())
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_keepalive(
    lease: Arc<Mutex<Lease>>,
    leases: Arc<DashMap<i64, LeaseEntry>>,
    strategy: Arc<dyn KeepAliveStrategy>,
    interval: Duration,
    max_failures: u32,
    request_timeout: Duration,
    expired_tx: broadcast::Sender<i64>,
    shutdown: CancellationToken,
) {
    let lease_id = lease.lock().id;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the lease was granted just now.
    ticker.tick().await;

    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let outcome = match timeout(request_timeout, strategy.keep_alive(lease_id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(request_timeout)),
        };

        match outcome {
            Ok(ttl) => {
                failures = 0;
                lease.lock().last_renewed = Instant::now();
                trace!(lease_id, ttl, "lease renewed");
            }
            Err(Error::LeaseExpired(_)) => {
                KEEPALIVE_FAILURES.with_label_values(&["not_found"]).inc();
                warn!(lease_id, "store no longer knows the lease");
                break;
            }
            Err(e) => {
                failures += 1;
                KEEPALIVE_FAILURES.with_label_values(&["error"]).inc();
                warn!(lease_id, failures, "keepalive failed: {}", e);
                if failures >= max_failures {
                    break;
                }
            }
        }
    }

    let newly_expired = {
        let mut lease = lease.lock();
        if lease.state == LeaseState::Active {
            lease.state = LeaseState::Expired;
            true
        } else {
            false
        }
    };
    if newly_expired {
        leases.remove_if(&lease_id, |_, entry| Arc::ptr_eq(&entry.lease, &lease));
        warn!(lease_id, "lease expired, keepalive stopped");
        let _ = expired_tx.send(lease_id);
    }
}
