//! Service registry coordinator on top of [`EtcdClient`].
//!
//! Producers [`register`](EtcdRegistry::register) addresses as ephemeral keys
//! bound to the session lease. Consumers [`subscribe`](EtcdRegistry::subscribe)
//! with a pattern address and receive the complete set of matching addresses,
//! never a delta, every time one of the watched category directories changes.
//! A category without a match is reported as one `empty://` placeholder.
//!
//! When the session lease expires the registry renews it and re-creates every
//! local registration in the background.

mod paths;


use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::constants::ANY_VALUE;
use crate::constants::CHECK_KEY;
use crate::constants::INTERFACE_KEY;
use crate::url::decode;
use crate::url::is_match;
use crate::utils::async_task::spawn_task;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::watch::ChildListener;
use crate::EtcdClient;
use crate::Error;
use crate::Result;
use crate::Url;

/// Callback receiving the complete current set of matching addresses
pub type NotifyListener = Arc<dyn Fn(&[Url]) + Send + Sync>;

fn same_notify(
    a: &NotifyListener,
    b: &NotifyListener,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// `(path, listener)` pairs registered with the watch manager
type Watches = Vec<(String, ChildListener)>;

/// Per-service watches of a wildcard subscription; `None` while being set up
type ServiceMap = Arc<Mutex<HashMap<String, Option<Watches>>>>;

/// Every notification of one subscription passes through its gate.
/// After [`NotifyGate::close`] returns the listener is never called again.
struct NotifyGate {
    listener: NotifyListener,
    open: Mutex<bool>,
}

impl NotifyGate {
    fn new(listener: NotifyListener) -> Arc<Self> {
        Arc::new(Self {
            listener,
            open: Mutex::new(true),
        })
    }

    fn notify(
        &self,
        urls: &[Url],
    ) {
        let open = self.open.lock();
        if *open {
            (self.listener)(urls);
        }
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn close(&self) {
        *self.open.lock() = false;
    }
}

#[derive(Default)]
struct ViewState {
    /// Set once the initial state of every category has been seeded
    ready: bool,
    categories: BTreeMap<String, Vec<Url>>,
}

/// Latest matches of every category of one service subscription
struct CategoryView {
    consumer: Url,
    gate: Arc<NotifyGate>,
    state: Mutex<ViewState>,
}

impl CategoryView {
    fn new(
        consumer: Url,
        gate: Arc<NotifyGate>,
    ) -> Self {
        Self {
            consumer,
            gate,
            state: Mutex::new(ViewState::default()),
        }
    }

    fn update(
        &self,
        category: &str,
        names: &[String],
    ) {
        let urls = self.matching(names);
        let mut state = self.state.lock();
        state.categories.insert(category.to_string(), urls);
        if state.ready {
            self.gate.notify(&self.collect(&state));
        }
    }

    /// Record the initial children unless a change callback already did
    fn seed(
        &self,
        category: &str,
        names: &[String],
    ) {
        let urls = self.matching(names);
        self.state
            .lock()
            .categories
            .entry(category.to_string())
            .or_insert(urls);
    }

    fn start(&self) {
        let mut state = self.state.lock();
        state.ready = true;
        self.gate.notify(&self.collect(&state));
    }

    fn collect(
        &self,
        state: &ViewState,
    ) -> Vec<Url> {
        let mut urls = Vec::new();
        for category in paths::subscribed_categories(&self.consumer) {
            match state.categories.get(category) {
                Some(matched) if !matched.is_empty() => urls.extend(matched.iter().cloned()),
                _ => urls.push(self.consumer.empty_placeholder(category)),
            }
        }
        urls
    }

    fn matching(
        &self,
        names: &[String],
    ) -> Vec<Url> {
        names
            .iter()
            .filter_map(|name| {
                let raw = decode(name);
                match raw.parse::<Url>() {
                    Ok(url) => Some(url),
                    Err(e) => {
                        debug!(child = %raw, "skipping undecodable registration: {}", e);
                        None
                    }
                }
            })
            .filter(|url| is_match(&self.consumer, url))
            .collect()
    }
}

struct Subscription {
    gate: Arc<NotifyGate>,
    watches: Watches,
    /// Set for `interface=*` subscriptions
    services: Option<ServiceMap>,
}

struct RegistryInner {
    url: Url,
    root: String,
    client: EtcdClient,
    registered: Mutex<BTreeSet<Url>>,
    subscribed: Mutex<HashMap<Url, Vec<Subscription>>>,
    shutdown: CancellationToken,
    destroyed: AtomicBool,
}

/// Registry handle. Cheap to clone; clones share registrations and subscriptions.
#[derive(Clone)]
pub struct EtcdRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for EtcdRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdRegistry")
            .field("url", &self.inner.url.to_full_string())
            .field("root", &self.inner.root)
            .field("destroyed", &self.inner.destroyed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EtcdRegistry {
    /// Connect to the etcd cluster named by the registry locator
    pub async fn connect(url: &Url) -> Result<Self> {
        let client = EtcdClient::connect(url).await?;
        Ok(Self::with_client(url.clone(), client).await)
    }

    /// Build a registry over an existing client; the registry takes over its lifecycle
    pub async fn with_client(
        url: Url,
        client: EtcdClient,
    ) -> Self {
        let inner = Arc::new(RegistryInner {
            url,
            root: client.config().root_dir(),
            client,
            registered: Mutex::new(BTreeSet::new()),
            subscribed: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        });
        spawn_recovery(&inner);
        info!(root = %inner.root, "registry started");
        Self { inner }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn client(&self) -> &EtcdClient {
        &self.inner.client
    }

    /// Publish `url` as an ephemeral key of the current session.
    /// Registering an address twice creates one key.
    pub async fn register(
        &self,
        url: &Url,
    ) -> Result<()> {
        self.ensure_alive(url)?;
        if self.inner.registered.lock().contains(url) {
            debug!(url = %url, "already registered");
            return Ok(());
        }

        let root = &self.inner.root;
        let url_path = paths::url_path(root, url);
        // a missing parent is reported against the key being registered
        self.inner
            .client
            .create_persistent(&paths::service_path(root, url))
            .await
            .map_err(|source| Error::Creation {
                path: url_path.clone(),
                source: Box::new(source),
            })?;
        self.inner.client.create_ephemeral(&url_path).await?;

        self.inner.registered.lock().insert(url.clone());
        info!(url = %url, "registered");
        Ok(())
    }

    /// Remove the key of `url`; unknown addresses are ignored
    pub async fn unregister(
        &self,
        url: &Url,
    ) -> Result<()> {
        self.ensure_alive(url)?;
        self.inner
            .client
            .delete(&paths::url_path(&self.inner.root, url))
            .await?;
        if self.inner.registered.lock().remove(url) {
            info!(url = %url, "unregistered");
        }
        Ok(())
    }

    /// Watch every category selected by `url` and notify `listener` with the
    /// full matching set, starting with the current state before returning.
    ///
    /// With `check=false` a failing subscription is logged instead of returned.
    pub async fn subscribe(
        &self,
        url: &Url,
        listener: NotifyListener,
    ) -> Result<()> {
        self.ensure_alive(url)?;
        if self.is_subscribed(url, &listener) {
            debug!(url = %url, "listener already subscribed");
            return Ok(());
        }

        let gate = NotifyGate::new(listener.clone());
        let result = if url.service_interface() == ANY_VALUE {
            self.inner.subscribe_all(url, gate).await
        } else {
            self.inner
                .subscribe_service(url, gate.clone())
                .await
                .map(|watches| Subscription {
                    gate,
                    watches,
                    services: None,
                })
        };

        let subscription = match result {
            Ok(subscription) => subscription,
            Err(e) if !url.bool_parameter(CHECK_KEY, true) => {
                warn!(url = %url, "subscribe failed, check disabled: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let rejected = {
            let mut subscribed = self.inner.subscribed.lock();
            let duplicate = subscribed
                .get(url)
                .is_some_and(|subs| subs.iter().any(|s| same_notify(&s.gate.listener, &listener)));
            if duplicate || self.inner.destroyed.load(Ordering::Acquire) {
                Some(subscription)
            } else {
                subscribed.entry(url.clone()).or_default().push(subscription);
                None
            }
        };
        if let Some(subscription) = rejected {
            self.inner.teardown(subscription).await;
            self.ensure_alive(url)?;
            return Ok(());
        }

        info!(url = %url, "subscribed");
        Ok(())
    }

    /// Stop notifying `listener` about `url`.
    /// Once this returns the listener is not called again for this subscription.
    pub async fn unsubscribe(
        &self,
        url: &Url,
        listener: &NotifyListener,
    ) {
        let removed = {
            let mut subscribed = self.inner.subscribed.lock();
            let Some(subs) = subscribed.get_mut(url) else {
                return;
            };
            let removed = subs
                .iter()
                .position(|s| same_notify(&s.gate.listener, listener))
                .map(|i| subs.remove(i));
            if subs.is_empty() {
                subscribed.remove(url);
            }
            removed
        };

        if let Some(subscription) = removed {
            self.inner.teardown(subscription).await;
            info!(url = %url, "unsubscribed");
        }
    }

    /// Point-in-time copy of the local registrations
    pub fn get_registered(&self) -> Vec<Url> {
        self.inner.registered.lock().iter().cloned().collect()
    }

    /// Point-in-time copy of the local subscriptions
    pub fn get_subscribed(&self) -> BTreeMap<Url, Vec<NotifyListener>> {
        self.inner
            .subscribed
            .lock()
            .iter()
            .map(|(url, subs)| (url.clone(), subs.iter().map(|s| s.gate.listener.clone()).collect()))
            .collect()
    }

    pub fn is_available(&self) -> bool {
        !self.is_destroyed() && self.inner.client.is_connected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Unregister and unsubscribe everything, then close the client
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let registered = std::mem::take(&mut *self.inner.registered.lock());
        for url in &registered {
            if let Err(e) = self
                .inner
                .client
                .delete(&paths::url_path(&self.inner.root, url))
                .await
            {
                warn!(url = %url, "failed to unregister on destroy: {}", e);
            }
        }

        let subscriptions: Vec<Subscription> = self
            .inner
            .subscribed
            .lock()
            .drain()
            .flat_map(|(_, subs)| subs)
            .collect();
        for subscription in subscriptions {
            self.inner.teardown(subscription).await;
        }

        self.inner.client.close().await;
        info!(
            registered = registered.len(),
            "registry destroyed"
        );
    }

    fn is_subscribed(
        &self,
        url: &Url,
        listener: &NotifyListener,
    ) -> bool {
        self.inner
            .subscribed
            .lock()
            .get(url)
            .is_some_and(|subs| subs.iter().any(|s| same_notify(&s.gate.listener, listener)))
    }

    fn ensure_alive(
        &self,
        url: &Url,
    ) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::ClosedClient {
                client: "registry",
                path: url.to_full_string(),
            });
        }
        Ok(())
    }
}

impl RegistryInner {
    /// Watch the category directories of one service
    async fn subscribe_service(
        &self,
        consumer: &Url,
        gate: Arc<NotifyGate>,
    ) -> Result<Watches> {
        let view = Arc::new(CategoryView::new(consumer.clone(), gate));
        let mut watches: Watches = Vec::new();

        for (category, path) in paths::category_paths(&self.root, consumer) {
            let listener: ChildListener = {
                let view = view.clone();
                let category = category.clone();
                Arc::new(move |_: &str, names: &[String]| view.update(&category, names))
            };

            let added = async {
                self.client.create_persistent(&path).await?;
                self.client.add_child_listener(&path, listener.clone()).await
            }
            .await;

            match added {
                Ok(names) => {
                    view.seed(&category, &names);
                    watches.push((path, listener));
                }
                Err(e) => {
                    self.remove_watches(watches).await;
                    return Err(e);
                }
            }
        }

        view.start();
        Ok(watches)
    }

    /// Watch the root for services and subscribe to each one as it appears
    async fn subscribe_all(
        self: &Arc<Self>,
        consumer: &Url,
        gate: Arc<NotifyGate>,
    ) -> Result<Subscription> {
        let services: ServiceMap = Arc::default();
        let listener: ChildListener = {
            let registry = Arc::downgrade(self);
            let runtime = Handle::current();
            let consumer = consumer.clone();
            let gate = gate.clone();
            let services = services.clone();
            Arc::new(move |_: &str, names: &[String]| {
                for name in names {
                    discover_service(&registry, &runtime, &consumer, &gate, &services, name);
                }
            })
        };

        self.client.create_persistent(&self.root).await?;
        let names = self.client.add_child_listener(&self.root, listener.clone()).await?;

        for name in names {
            if !claim_service(&services, &name) {
                continue;
            }
            match self
                .subscribe_service(&service_consumer(consumer, &name), gate.clone())
                .await
            {
                Ok(watches) => {
                    services.lock().insert(name, Some(watches));
                }
                Err(e) => {
                    warn!(service = %name, "failed to subscribe discovered service: {}", e);
                    services.lock().remove(&name);
                }
            }
        }

        Ok(Subscription {
            gate,
            watches: vec![(self.root.clone(), listener)],
            services: Some(services),
        })
    }

    async fn teardown(
        &self,
        subscription: Subscription,
    ) {
        subscription.gate.close();
        self.remove_watches(subscription.watches).await;
        if let Some(services) = subscription.services {
            let drained: Vec<Watches> = services.lock().drain().filter_map(|(_, w)| w).collect();
            for watches in drained {
                self.remove_watches(watches).await;
            }
        }
    }

    async fn remove_watches(
        &self,
        watches: Watches,
    ) {
        for (path, listener) in watches {
            self.client.remove_child_listener(&path, &listener).await;
        }
    }

    async fn recover(
        &self,
        lease_id: i64,
    ) {
        if !self.client.config().recover_on_expiry {
            warn!(lease_id, "session lease expired, automatic recovery disabled");
            return;
        }
        warn!(lease_id, "session lease expired, restoring registrations");

        let policy = self.client.config().recovery;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            result = task_with_timeout_and_exponential_backoff(|| self.reregister(), policy) => {
                if let Err(e) = result {
                    warn!(lease_id, "failed to restore registrations: {}", e);
                }
            }
        }
    }

    async fn reregister(&self) -> Result<()> {
        let lease_id = self.client.leases().renew_session().await?;
        let registered: Vec<Url> = self.registered.lock().iter().cloned().collect();
        for url in &registered {
            self.client
                .create_ephemeral(&paths::url_path(&self.root, url))
                .await?;
        }
        info!(lease_id, count = registered.len(), "registrations restored");
        Ok(())
    }
}

/// Listen for session expiry for as long as the registry lives
fn spawn_recovery(inner: &Arc<RegistryInner>) {
    let mut expired = inner.client.leases().subscribe_expired();
    let shutdown = inner.shutdown.clone();
    let registry = Arc::downgrade(inner);

    spawn_task("session recovery", move || async move {
        loop {
            let lease_id = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = expired.recv() => match received {
                    Ok(id) => id,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed lease expiry notifications");
                        continue;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            };
            let Some(registry) = registry.upgrade() else {
                return Ok(());
            };
            registry.recover(lease_id).await;
        }
    });
}

/// Consumer pattern narrowed to one discovered service
fn service_consumer(
    consumer: &Url,
    name: &str,
) -> Url {
    consumer
        .clone()
        .with_parameter(INTERFACE_KEY, decode(name))
        .with_parameter(CHECK_KEY, "false")
}

/// Mark `name` as being subscribed; false if it already is
fn claim_service(
    services: &ServiceMap,
    name: &str,
) -> bool {
    let mut services = services.lock();
    if services.contains_key(name) {
        return false;
    }
    services.insert(name.to_string(), None);
    true
}

/// Subscribe to a service that appeared under the root of a wildcard subscription
fn discover_service(
    registry: &Weak<RegistryInner>,
    runtime: &Handle,
    consumer: &Url,
    gate: &Arc<NotifyGate>,
    services: &ServiceMap,
    name: &str,
) {
    if !gate.is_open() || !claim_service(services, name) {
        return;
    }
    let Some(registry) = registry.upgrade() else {
        return;
    };
    trace!(service = name, "new service discovered");

    let consumer = service_consumer(consumer, name);
    let gate = gate.clone();
    let services = services.clone();
    let name = name.to_string();
    runtime.spawn(async move {
        match registry.subscribe_service(&consumer, gate.clone()).await {
            Ok(watches) => {
                let leftover = {
                    let mut map = services.lock();
                    if gate.is_open() {
                        map.insert(name, Some(watches));
                        None
                    } else {
                        Some(watches)
                    }
                };
                if let Some(watches) = leftover {
                    registry.remove_watches(watches).await;
                }
            }
            Err(e) => {
                warn!(service = %name, "failed to subscribe discovered service: {}", e);
                services.lock().remove(&name);
            }
        }
    });
}
