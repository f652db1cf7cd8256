use std::sync::Arc;
use std::time::Duration;

use etcd_registry::EtcdClient;
use etcd_registry::EtcdRegistry;
use etcd_registry::Error;
use etcd_registry::KeepAliveStrategy;
use etcd_registry::MemoryBackend;
use etcd_registry::RegistryConfig;
use tonic::async_trait;
use tonic::Status;
use tracing_test::traced_test;

use crate::common::consumer;
use crate::common::hosts;
use crate::common::locator;
use crate::common::memory_registry;
use crate::common::notify_recorder;
use crate::common::provider;
use crate::common::wait_until;
use crate::common::GREETER;

/// Keepalive that never reaches the store
struct UnreachableKeepAlive;

#[async_trait]
impl KeepAliveStrategy for UnreachableKeepAlive {
    async fn keep_alive(
        &self,
        _lease_id: i64,
    ) -> etcd_registry::Result<i64> {
        Err(Error::Connection {
            operation: "keepalive",
            source: Status::unavailable("keepalive rejected"),
        })
    }
}

#[tokio::test]
#[traced_test]
async fn test_register_then_subscribe_notifies_exactly_once() {
    let backend = MemoryBackend::new();
    let registry = memory_registry(&backend).await;
    let (listener, seen) = notify_recorder();

    registry.register(&provider("10.0.0.1", GREETER)).await.unwrap();
    registry.subscribe(&consumer(GREETER), listener).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "expected a single notification: {seen:?}");
    assert_eq!(hosts(&seen[0]), vec!["10.0.0.1"]);
}

#[tokio::test]
async fn test_subscriber_sees_both_registrations_but_not_other_interfaces() {
    let backend = MemoryBackend::new();
    let registry = memory_registry(&backend).await;
    let (listener, seen) = notify_recorder();

    registry.subscribe(&consumer(GREETER), listener).await.unwrap();
    registry.register(&provider("10.0.0.1", GREETER)).await.unwrap();
    registry.register(&provider("10.0.0.2", GREETER)).await.unwrap();
    registry
        .register(&provider("10.0.0.3", "org.example.Farewell"))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            seen.lock()
                .last()
                .is_some_and(|urls| hosts(urls) == vec!["10.0.0.1", "10.0.0.2"])
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!seen
        .lock()
        .iter()
        .any(|urls| hosts(urls).contains(&"10.0.0.3".to_string())));
}

#[tokio::test]
async fn test_unsubscribed_listener_receives_nothing_further() {
    let backend = MemoryBackend::new();
    let registry = memory_registry(&backend).await;
    let (listener, seen) = notify_recorder();
    let subscriber = consumer(GREETER);

    registry.subscribe(&subscriber, listener.clone()).await.unwrap();
    registry.unsubscribe(&subscriber, &listener).await;
    let before = seen.lock().len();

    registry.register(&provider("10.0.0.7", GREETER)).await.unwrap();
    let notified = wait_until(Duration::from_secs(2), || seen.lock().len() > before).await;

    assert!(!notified, "listener fired after unsubscribe");
}

#[tokio::test]
async fn test_wildcard_subscriber_sees_every_service() {
    let backend = MemoryBackend::new();
    let registry = memory_registry(&backend).await;
    let (listener, seen) = notify_recorder();

    registry.register(&provider("10.0.0.1", GREETER)).await.unwrap();
    registry.subscribe(&consumer("*"), listener).await.unwrap();
    registry
        .register(&provider("10.0.0.2", "org.example.Farewell"))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            let seen = seen.lock();
            let all: Vec<String> = seen.iter().flat_map(|urls| hosts(urls)).collect();
            all.contains(&"10.0.0.1".to_string()) && all.contains(&"10.0.0.2".to_string())
        })
        .await
    );
}

#[tokio::test]
async fn test_two_registries_share_one_store() {
    let backend = MemoryBackend::new();
    let producer = memory_registry(&backend).await;
    let consumer_side = memory_registry(&backend).await;
    let (listener, seen) = notify_recorder();

    consumer_side
        .subscribe(&consumer(GREETER), listener)
        .await
        .unwrap();
    producer.register(&provider("10.0.0.1", GREETER)).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            seen.lock().last().is_some_and(|urls| hosts(urls) == vec!["10.0.0.1"])
        })
        .await
    );

    // the producer's session goes away with its keys
    producer.destroy().await;
    assert!(
        wait_until(Duration::from_secs(3), || {
            seen.lock()
                .last()
                .is_some_and(|urls| urls.iter().all(|u| u.is_empty_placeholder()))
        })
        .await
    );
    assert!(consumer_side.is_available());
}

#[tokio::test]
async fn test_register_fails_with_path_after_keepalive_failures() {
    let backend = MemoryBackend::new();
    let config = RegistryConfig {
        recover_on_expiry: false,
        ..Default::default()
    };
    let client = EtcdClient::builder(config)
        .backend(Arc::new(backend.clone()))
        .keep_alive_strategy(Arc::new(UnreachableKeepAlive))
        .session_timeout(Duration::from_millis(1000))
        .notify_threads(1)
        .build()
        .await
        .unwrap();
    let registry = EtcdRegistry::with_client(locator(), client.clone()).await;

    client.create_ephemeral("/dubbo/warmup/providers/node-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let err = client
        .create_ephemeral("/dubbo/org.example.Greeter/providers/node-1")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "failed to create ephemeral by path '/dubbo/org.example.Greeter/providers/node-1'"
    );

    let url = provider("10.0.0.1", GREETER);
    let err = registry.register(&url).await.unwrap_err();
    assert!(matches!(err, Error::Creation { .. }));
    assert!(err
        .to_string()
        .starts_with("failed to create ephemeral by path '/dubbo/org.example.Greeter/providers/"));
    assert!(registry.get_registered().is_empty());
}

#[tokio::test]
async fn test_destroyed_registry_rejects_further_calls() {
    let backend = MemoryBackend::new();
    let registry = memory_registry(&backend).await;
    let (listener, _seen) = notify_recorder();
    let url = provider("10.0.0.1", GREETER);
    registry.register(&url).await.unwrap();

    registry.destroy().await;
    registry.destroy().await;

    assert!(registry.is_destroyed());
    assert!(backend.lease_ids().is_empty());
    let err = registry.subscribe(&consumer(GREETER), listener).await.unwrap_err();
    assert!(err.is_closed_client());
}

#[tokio::test]
async fn test_register_against_unreachable_store_fails_with_path() {
    let backend = MemoryBackend::new();
    let registry = memory_registry(&backend).await;
    backend.set_available(false);

    let err = registry
        .register(&provider("10.0.0.1", GREETER))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Creation { .. }), "{err:?}");
    assert!(err
        .to_string()
        .starts_with("failed to create ephemeral by path '/dubbo/org.example.Greeter/providers/"));
}
