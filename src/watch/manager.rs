use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use super::executor::NotifyExecutor;
use super::watcher::run_watcher;
use super::watcher::WatcherShared;
use super::ChildListener;
use super::WatchContext;
use super::WatchState;
use super::WatcherHandle;
use crate::keystore::child_prefix;
use crate::keystore::KeyStore;
use crate::store::KvBackend;
use crate::Error;
use crate::Result;
use crate::WatchConfig;

struct Watcher {
    shared: Arc<WatcherShared>,
    task: JoinHandle<()>,
}

impl Watcher {
    async fn close(self) {
        self.shared.close().await;
        self.task.abort();
    }
}

/// Owns every watcher of a client, keyed by path
pub struct WatchManager {
    ctx: Arc<WatchContext>,
    watchers: tokio::sync::Mutex<HashMap<String, Watcher>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("executor", &self.ctx.executor)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WatchManager {
    pub fn new(
        key_store: Arc<KeyStore>,
        backend: Arc<dyn KvBackend>,
        config: WatchConfig,
    ) -> Result<Self> {
        let executor = NotifyExecutor::new(config.notify_threads, config.notify_queue_size)?;
        Ok(Self {
            ctx: Arc::new(WatchContext {
                key_store,
                backend,
                executor,
                config,
            }),
            watchers: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Register `listener` on `path` and return the current child names.
    ///
    /// The first listener of a path opens the watch at the snapshot revision;
    /// later listeners share the same stream.
    pub async fn add_child_listener(
        &self,
        path: &str,
        listener: ChildListener,
    ) -> Result<Vec<String>> {
        self.ensure_open(path)?;
        let mut watchers = self.watchers.lock().await;
        self.ensure_open(path)?;

        if let Some(watcher) = watchers.get(path) {
            match watcher.shared.state() {
                WatchState::Cancelled => return Err(watcher.shared.cancelled_error()),
                WatchState::Closed => return Err(self.closed_error(path)),
                WatchState::Active | WatchState::Reconnecting => {}
            }
            let snapshot = self.ctx.key_store.get_children(path).await?;
            if watcher.shared.add_listener(listener, snapshot.revision) {
                debug!(path, listeners = watcher.shared.listener_count(), "listener joined watcher");
            }
            return Ok(snapshot.names());
        }

        let snapshot = self.ctx.key_store.get_children(path).await?;
        let stream = self
            .ctx
            .backend
            .watch_prefix(&child_prefix(path), snapshot.revision + 1)
            .await
            .map_err(|status| Error::from_status("watch", status))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shared, signals) = WatcherShared::new(id, path.to_string(), snapshot.revision, stream.control);
        shared.add_listener(listener, snapshot.revision);

        let task = tokio::spawn(run_watcher(
            shared.clone(),
            self.ctx.clone(),
            stream.events,
            signals,
        ));
        watchers.insert(path.to_string(), Watcher { shared, task });
        info!(path, revision = snapshot.revision, "watcher created");

        Ok(snapshot.names())
    }

    /// Remove `listener` from `path`; the watcher goes away with its last listener.
    /// After this returns the listener is never invoked again.
    pub async fn remove_child_listener(
        &self,
        path: &str,
        listener: &ChildListener,
    ) {
        let mut watchers = self.watchers.lock().await;
        let Some(shared) = watchers.get(path).map(|w| w.shared.clone()) else {
            return;
        };
        if shared.remove_listener(listener) {
            return;
        }

        // cancel the stream and drop the listeners before forgetting the path
        shared.close().await;
        if let Some(watcher) = watchers.remove(path) {
            watcher.task.abort();
        }
        info!(path, "watcher removed");
    }

    /// The live watcher of `path`, if `listener` is registered on it
    pub async fn get_child_listener(
        &self,
        path: &str,
        listener: &ChildListener,
    ) -> Option<WatcherHandle> {
        let watchers = self.watchers.lock().await;
        watchers
            .get(path)
            .filter(|w| w.shared.contains_listener(listener))
            .map(|w| WatcherHandle::new(w.shared.clone()))
    }

    /// Paths that currently have a watcher
    pub async fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.watchers.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Close every watcher. No listener runs after this returns.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Watcher> = self.watchers.lock().await.drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for watcher in drained {
            watcher.close().await;
        }
        self.ctx.executor.shutdown();
        info!(watchers = count, "watch manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Callbacks queued but not yet run
    pub fn pending_notifications(&self) -> usize {
        self.ctx.executor.pending()
    }

    fn ensure_open(
        &self,
        path: &str,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error(path));
        }
        Ok(())
    }

    fn closed_error(
        &self,
        path: &str,
    ) -> Error {
        Error::ClosedClient {
            client: "watch",
            path: path.to_string(),
        }
    }
}
