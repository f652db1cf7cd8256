//! Child watches: one streaming watch per path, shared by all of its listeners.
//!
//! # Architecture
//!
//! ```text
//! store watch stream ──► watcher loop ──► KeyStore::get_children ──► NotifyExecutor
//!   (one per path)        (tokio task)     (full snapshot)            (worker threads)
//!                                                                       │
//!                                                    listener(path, child names)
//! ```
//!
//! Listeners always receive the complete current list of immediate child
//! names, never a delta. Recoverable stream failures are absorbed: the loop
//! re-opens the stream from the snapshot revision and delivers one synthetic
//! snapshot. Unrecoverable failures leave the watcher Cancelled, and the next
//! request on it fails with [`crate::Error::StreamCancelled`].

mod executor;
mod manager;
mod watcher;

pub use manager::WatchManager;
pub use watcher::WatcherHandle;

#[cfg(test)]
mod executor_test;

use std::sync::Arc;

use crate::keystore::KeyStore;
use crate::store::KvBackend;
use crate::WatchConfig;

use self::executor::NotifyExecutor;

/// Callback invoked with `(path, child names)` on every membership change
pub type ChildListener = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Active,
    Reconnecting,
    /// Invalidated by the server; terminal for this watcher
    Cancelled,
    /// Torn down by the client
    Closed,
}

/// Everything a watcher loop needs, without a reference back to the manager
pub(crate) struct WatchContext {
    pub(crate) key_store: Arc<KeyStore>,
    pub(crate) backend: Arc<dyn KvBackend>,
    pub(crate) executor: NotifyExecutor,
    pub(crate) config: WatchConfig,
}
