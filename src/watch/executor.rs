//! Bounded worker pool that runs listener callbacks off the event-read path.
//!
//! Jobs are sharded by watcher id, so callbacks of one watcher run in order on
//! one worker while different watchers proceed in parallel. Submission never
//! blocks: once `queue_size` jobs are pending, new jobs are dropped.

use std::any::Any;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::unbounded;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::metrics::NOTIFICATIONS_DROPPED;
use crate::Error;
use crate::Result;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct NotifyExecutor {
    senders: RwLock<Vec<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    queue_size: usize,
}

impl std::fmt::Debug for NotifyExecutor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NotifyExecutor")
            .field("workers", &self.senders.read().len())
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl NotifyExecutor {
    pub(crate) fn new(
        threads: usize,
        queue_size: usize,
    ) -> Result<Self> {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads.max(1) {
            let (tx, rx) = unbounded::<Job>();
            let pending = pending.clone();
            let handle = std::thread::Builder::new()
                .name(format!("registry-notify-{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                            error!("notify job panicked: {}", panic_message(panic.as_ref()));
                        }
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                    debug!("notify worker {} stopped", i);
                })
                .map_err(|e| Error::Fatal(format!("failed to spawn notify worker: {e}")))?;
            senders.push(tx);
            workers.push(handle);
        }

        Ok(Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            pending,
            queue_size: queue_size.max(1),
        })
    }

    /// Queue `job` on the worker owning `shard`. Returns false if the job was dropped.
    pub(crate) fn submit(
        &self,
        shard: u64,
        job: Job,
    ) -> bool {
        let senders = self.senders.read();
        if senders.is_empty() {
            return false;
        }

        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.queue_size {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            NOTIFICATIONS_DROPPED.inc();
            warn!(queue_size = self.queue_size, "notify queue full, dropping callback");
            return false;
        }

        let index = (shard % senders.len() as u64) as usize;
        if senders[index].send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting jobs. Workers drain what is queued and exit.
    pub(crate) fn shutdown(&self) {
        self.senders.write().clear();
        // Workers are detached; a listener may be the one closing the client.
        self.workers.lock().clear();
    }
}

impl Drop for NotifyExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
