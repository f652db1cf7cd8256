use std::cell::Cell;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use parking_lot::ReentrantMutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::executor::panic_message;
use super::ChildListener;
use super::WatchContext;
use super::WatchState;
use crate::errors::is_recoverable;
use crate::keystore::child_prefix;
use crate::keystore::is_immediate_child;
use crate::keystore::ChildrenSnapshot;
use crate::metrics::NOTIFICATIONS_DELIVERED;
use crate::metrics::WATCH_RECONNECTS;
use crate::store::StoreResult;
use crate::store::WatchBatch;
use crate::store::WatchControl;
use crate::store::WatchEvents;
use crate::utils::async_task::backoff_with_jitter;
use crate::Error;
use crate::Result;

pub(crate) fn same_listener(
    a: &ChildListener,
    b: &ChildListener,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct SlotGate {
    active: Cell<bool>,
    /// Lowest revision this listener may still be shown
    floor: Cell<i64>,
}

/// One registered listener.
///
/// Every invocation runs under `gate`, so once [`ListenerSlot::deactivate`]
/// returns the listener is neither running nor going to run again. The lock is
/// reentrant because a listener may remove itself from inside its callback.
pub(crate) struct ListenerSlot {
    listener: ChildListener,
    gate: ReentrantMutex<SlotGate>,
}

impl ListenerSlot {
    pub(crate) fn new(
        listener: ChildListener,
        floor: i64,
    ) -> Self {
        Self {
            listener,
            gate: ReentrantMutex::new(SlotGate {
                active: Cell::new(true),
                floor: Cell::new(floor),
            }),
        }
    }

    pub(crate) fn invoke(
        &self,
        path: &str,
        names: &[String],
        revision: i64,
    ) -> bool {
        let gate = self.gate.lock();
        if !gate.active.get() || revision < gate.floor.get() {
            return false;
        }
        gate.floor.set(revision);

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.listener)(path, names))) {
            error!(path, "child listener panicked: {}", panic_message(panic.as_ref()));
        }
        true
    }

    pub(crate) fn deactivate(&self) {
        let gate = self.gate.lock();
        gate.active.set(false);
    }
}

/// State shared between a watcher's event loop, the manager, and handles
pub(crate) struct WatcherShared {
    pub(crate) id: u64,
    pub(crate) path: String,
    state: Mutex<WatchState>,
    cause: Mutex<Option<Status>>,
    last_revision: AtomicI64,
    slots: RwLock<Vec<Arc<ListenerSlot>>>,
    control: tokio::sync::Mutex<Option<Box<dyn WatchControl>>>,
    signal: mpsc::UnboundedSender<Status>,
    pub(crate) shutdown: CancellationToken,
}

impl WatcherShared {
    pub(crate) fn new(
        id: u64,
        path: String,
        revision: i64,
        control: Box<dyn WatchControl>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Status>) {
        let (signal, signals) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            path,
            state: Mutex::new(WatchState::Active),
            cause: Mutex::new(None),
            last_revision: AtomicI64::new(revision),
            slots: RwLock::new(Vec::new()),
            control: tokio::sync::Mutex::new(Some(control)),
            signal,
            shutdown: CancellationToken::new(),
        });
        (shared, signals)
    }

    pub(crate) fn state(&self) -> WatchState {
        *self.state.lock()
    }

    /// Move to `to` if the current state is one of `from`
    fn transition(
        &self,
        from: &[WatchState],
        to: WatchState,
    ) -> bool {
        let mut state = self.state.lock();
        if from.contains(&*state) {
            trace!(path = %self.path, from = ?*state, to = ?to, "watcher state change");
            *state = to;
            true
        } else {
            false
        }
    }

    fn mark_cancelled(
        &self,
        cause: Status,
    ) -> bool {
        if self.transition(&[WatchState::Active, WatchState::Reconnecting], WatchState::Cancelled) {
            *self.cause.lock() = Some(cause);
            true
        } else {
            false
        }
    }

    pub(crate) fn cancelled_error(&self) -> Error {
        let source = self
            .cause
            .lock()
            .clone()
            .unwrap_or_else(|| Status::cancelled("call was cancelled"));
        Error::StreamCancelled {
            path: self.path.clone(),
            source,
        }
    }

    /// Add `listener` unless it is already registered. Returns false on duplicates.
    pub(crate) fn add_listener(
        &self,
        listener: ChildListener,
        floor: i64,
    ) -> bool {
        let mut slots = self.slots.write();
        if slots.iter().any(|s| same_listener(&s.listener, &listener)) {
            return false;
        }
        slots.push(Arc::new(ListenerSlot::new(listener, floor)));
        true
    }

    pub(crate) fn contains_listener(
        &self,
        listener: &ChildListener,
    ) -> bool {
        self.slots.read().iter().any(|s| same_listener(&s.listener, listener))
    }

    /// Remove and deactivate `listener`; returns whether any listener is left
    pub(crate) fn remove_listener(
        &self,
        listener: &ChildListener,
    ) -> bool {
        let removed = {
            let mut slots = self.slots.write();
            let index = slots.iter().position(|s| same_listener(&s.listener, listener));
            index.map(|i| slots.remove(i))
        };
        if let Some(slot) = removed {
            slot.deactivate();
        }
        !self.slots.read().is_empty()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Tear the watcher down: cancel the stream, then drop every listener
    pub(crate) async fn close(&self) {
        {
            let mut state = self.state.lock();
            *state = WatchState::Closed;
        }
        self.shutdown.cancel();

        if let Some(mut control) = self.control.lock().await.take() {
            if let Err(status) = control.cancel().await {
                debug!(path = %self.path, %status, "watch cancel on close failed");
            }
        }

        let slots: Vec<Arc<ListenerSlot>> = std::mem::take(&mut *self.slots.write());
        for slot in slots {
            slot.deactivate();
        }
    }
}

/// Introspection and failure injection for a live watcher
#[derive(Clone)]
pub struct WatcherHandle {
    shared: Arc<WatcherShared>,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .field("last_revision", &self.last_revision())
            .finish()
    }
}

impl WatcherHandle {
    pub(crate) fn new(shared: Arc<WatcherShared>) -> Self {
        Self { shared }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn state(&self) -> WatchState {
        self.shared.state()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listener_count()
    }

    /// Revision of the last snapshot handed to listeners
    pub fn last_revision(&self) -> i64 {
        self.shared.last_revision.load(Ordering::Acquire)
    }

    /// Inject a stream failure as if the server had sent `status`.
    ///
    /// The failure is classified before this returns: an unrecoverable status
    /// leaves the watcher Cancelled, a recoverable one leaves it Reconnecting.
    pub fn fail_stream(
        &self,
        status: Status,
    ) {
        if is_recoverable(&status) {
            self.shared
                .transition(&[WatchState::Active], WatchState::Reconnecting);
        } else {
            self.shared.mark_cancelled(status.clone());
        }
        let _ = self.shared.signal.send(status);
    }

    /// Send the next request on the stream (a progress request).
    ///
    /// Fails with [`Error::StreamCancelled`] once the stream was invalidated,
    /// and with [`Error::Connection`] while a reconnect has no stream open yet.
    pub async fn send_next_request(&self) -> Result<()> {
        match self.shared.state() {
            WatchState::Cancelled => return Err(self.shared.cancelled_error()),
            WatchState::Closed => {
                return Err(Error::ClosedClient {
                    client: "watch",
                    path: self.shared.path.clone(),
                })
            }
            WatchState::Active | WatchState::Reconnecting => {}
        }

        let mut control = self.shared.control.lock().await;
        let Some(control) = control.as_mut() else {
            return Err(match self.shared.state() {
                WatchState::Cancelled => self.shared.cancelled_error(),
                WatchState::Closed => Error::ClosedClient {
                    client: "watch",
                    path: self.shared.path.clone(),
                },
                WatchState::Active | WatchState::Reconnecting => Error::Connection {
                    operation: "send watch request",
                    source: Status::unavailable("watch stream is reconnecting"),
                },
            });
        };
        control.request_progress().await.map_err(|status| {
            if is_recoverable(&status) {
                Error::from_status("send watch request", status)
            } else {
                Error::StreamCancelled {
                    path: self.shared.path.clone(),
                    source: status,
                }
            }
        })
    }
}

/// Event loop of one watcher. Exits on shutdown or unrecoverable failure.
pub(crate) async fn run_watcher(
    shared: Arc<WatcherShared>,
    ctx: Arc<WatchContext>,
    mut events: WatchEvents,
    mut signals: mpsc::UnboundedReceiver<Status>,
) {
    debug!(path = %shared.path, "watcher started");
    loop {
        let failure = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            Some(status) = signals.recv() => status,
            item = events.next() => match item {
                Some(Ok(batch)) => match on_batch(&shared, &ctx, batch).await {
                    None => continue,
                    Some(status) => status,
                },
                Some(Err(status)) => status,
                None => Status::unavailable("watch stream closed by server"),
            },
        };

        if !handle_failure(&shared, &ctx, failure, &mut events).await {
            break;
        }
    }
    debug!(path = %shared.path, state = ?shared.state(), "watcher stopped");
}

/// Re-read the children after a relevant batch and dispatch them.
/// A failed re-read is returned as a stream failure so the watcher resyncs.
async fn on_batch(
    shared: &Arc<WatcherShared>,
    ctx: &Arc<WatchContext>,
    batch: WatchBatch,
) -> Option<Status> {
    if shared.state() != WatchState::Active {
        return None;
    }
    if !batch.events.iter().any(|e| is_immediate_child(&shared.path, &e.key)) {
        trace!(path = %shared.path, revision = batch.revision, "batch touches no child");
        return None;
    }

    match ctx.key_store.get_children(&shared.path).await {
        Ok(snapshot) => {
            dispatch(shared, ctx, snapshot);
            None
        }
        Err(e) => {
            warn!(path = %shared.path, "failed to re-read children: {}", e);
            Some(Status::unavailable(e.to_string()))
        }
    }
}

async fn handle_failure(
    shared: &Arc<WatcherShared>,
    ctx: &Arc<WatchContext>,
    status: Status,
    events: &mut WatchEvents,
) -> bool {
    if !is_recoverable(&status) {
        error!(path = %shared.path, %status, "watch stream failed unrecoverably");
        shared.mark_cancelled(status);
        if let Some(control) = shared.control.lock().await.as_mut() {
            let _ = control.cancel().await;
        }
        return false;
    }

    if !shared.transition(
        &[WatchState::Active, WatchState::Reconnecting],
        WatchState::Reconnecting,
    ) {
        return false;
    }
    warn!(path = %shared.path, %status, "watch stream interrupted, reconnecting");
    WATCH_RECONNECTS.with_label_values(&[&shared.path]).inc();

    if let Some(mut old) = shared.control.lock().await.take() {
        let _ = old.cancel().await;
    }

    let mut attempt = 0u32;
    loop {
        let delay = backoff_with_jitter(
            attempt,
            ctx.config.reconnect_base_delay(),
            ctx.config.reconnect_max_delay(),
        );
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        let reopened = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return false,
            r = reopen(shared, ctx) => r,
        };

        match reopened {
            Ok((snapshot, stream_events, control)) => {
                *shared.control.lock().await = Some(control);
                *events = stream_events;
                if !shared.transition(&[WatchState::Reconnecting], WatchState::Active) {
                    return false;
                }
                debug!(path = %shared.path, revision = snapshot.revision, attempt, "watch stream re-established");
                dispatch(shared, ctx, snapshot);
                return true;
            }
            Err(status) if !is_recoverable(&status) => {
                error!(path = %shared.path, attempt, %status, "reconnect failed unrecoverably");
                shared.mark_cancelled(status);
                return false;
            }
            Err(status) => {
                warn!(path = %shared.path, attempt, %status, "reconnect failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Re-read the children and open a new stream after them.
/// A failed re-read stays recoverable; a refused watch keeps its status.
async fn reopen(
    shared: &WatcherShared,
    ctx: &WatchContext,
) -> StoreResult<(ChildrenSnapshot, WatchEvents, Box<dyn WatchControl>)> {
    let snapshot = ctx
        .key_store
        .get_children(&shared.path)
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;
    let stream = ctx
        .backend
        .watch_prefix(&child_prefix(&shared.path), snapshot.revision + 1)
        .await?;
    Ok((snapshot, stream.events, stream.control))
}

/// Queue one full-snapshot callback for every listener of the watcher
pub(crate) fn dispatch(
    shared: &Arc<WatcherShared>,
    ctx: &WatchContext,
    snapshot: ChildrenSnapshot,
) {
    let revision = snapshot.revision;
    let previous = shared.last_revision.fetch_max(revision, Ordering::AcqRel);
    if revision < previous {
        trace!(path = %shared.path, revision, previous, "stale snapshot skipped");
        return;
    }

    let slots: Vec<Arc<ListenerSlot>> = shared.slots.read().clone();
    if slots.is_empty() {
        return;
    }

    let names = snapshot.names();
    let path = shared.path.clone();
    let count = slots.len() as u64;
    let job = Box::new(move || {
        for slot in &slots {
            slot.invoke(&path, &names, revision);
        }
    });

    if ctx.executor.submit(shared.id, job) {
        NOTIFICATIONS_DELIVERED.inc_by(count);
        trace!(path = %shared.path, revision, listeners = count, "snapshot queued");
    }
}
