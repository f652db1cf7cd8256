use std::sync::Arc;
use std::time::Duration;

use etcd_registry::ChildListener;
use etcd_registry::EtcdClient;
use etcd_registry::EtcdRegistry;
use etcd_registry::MemoryBackend;
use etcd_registry::NotifyListener;
use etcd_registry::RegistryConfig;
use etcd_registry::Url;
use parking_lot::Mutex;

pub const GREETER: &str = "org.example.Greeter";

pub async fn memory_client(
    backend: &MemoryBackend,
    config: RegistryConfig,
) -> EtcdClient {
    EtcdClient::builder(config)
        .backend(Arc::new(backend.clone()))
        .notify_threads(2)
        .build()
        .await
        .unwrap()
}

pub async fn memory_registry(backend: &MemoryBackend) -> EtcdRegistry {
    let client = memory_client(backend, RegistryConfig::default()).await;
    EtcdRegistry::with_client(locator(), client).await
}

pub fn locator() -> Url {
    "etcd3://127.0.0.1:2379/org.apache.dubbo.registry.RegistryService?session-timeout=60000"
        .parse()
        .unwrap()
}

pub fn provider(
    host: &str,
    interface: &str,
) -> Url {
    format!("dubbo://{host}:20880/{interface}?interface={interface}&version=1.0.0&side=provider")
        .parse()
        .unwrap()
}

pub fn consumer(interface: &str) -> Url {
    format!("consumer://10.0.0.9/{interface}?interface={interface}&version=1.0.0&category=providers&side=consumer")
        .parse()
        .unwrap()
}

pub type Notifications = Arc<Mutex<Vec<Vec<Url>>>>;

pub fn notify_recorder() -> (NotifyListener, Notifications) {
    let seen: Notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: NotifyListener = Arc::new(move |urls: &[Url]| sink.lock().push(urls.to_vec()));
    (listener, seen)
}

pub type ChildCalls = Arc<Mutex<Vec<Vec<String>>>>;

pub fn child_recorder() -> (ChildListener, ChildCalls) {
    let calls: ChildCalls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let listener: ChildListener = Arc::new(move |_path: &str, children: &[String]| {
        sink.lock().push(children.to_vec());
    });
    (listener, calls)
}

/// Poll `condition` every 10ms for up to `limit`
pub async fn wait_until(
    limit: Duration,
    condition: impl Fn() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Non-placeholder hosts of one notification, sorted
pub fn hosts(urls: &[Url]) -> Vec<String> {
    let mut hosts: Vec<String> = urls
        .iter()
        .filter(|u| !u.is_empty_placeholder())
        .map(|u| u.host().to_string())
        .collect();
    hosts.sort();
    hosts
}
