use std::sync::Arc;
use std::time::Duration;

use tonic::Status;

use super::*;
use crate::lease::BackendKeepAlive;
use crate::lease::MockKeepAliveStrategy;
use crate::store::MemoryBackend;
use crate::store::MockKvBackend;
use crate::LeaseConfig;

fn key_store_with(
    backend: &MemoryBackend,
    strategy: Arc<dyn crate::lease::KeepAliveStrategy>,
    session_timeout_ms: u64,
) -> KeyStore {
    let kv: Arc<dyn KvBackend> = Arc::new(backend.clone());
    let leases = Arc::new(LeaseManager::new(
        kv.clone(),
        strategy,
        LeaseConfig {
            session_timeout_ms,
            ..LeaseConfig::default()
        },
        Duration::from_millis(500),
    ));
    KeyStore::new(kv, leases, Duration::from_millis(500))
}

fn key_store(backend: &MemoryBackend) -> KeyStore {
    key_store_with(
        backend,
        Arc::new(BackendKeepAlive::new(Arc::new(backend.clone()))),
        60_000,
    )
}

#[tokio::test]
async fn get_children_should_exclude_grandchildren() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);
    for path in ["/a/1", "/a/2", "/a/3", "/a/4", "/a/5/exclude"] {
        store.create_persistent(path).await.unwrap();
    }

    let snapshot = store.get_children("/a").await.unwrap();

    assert_eq!(snapshot.children.len(), 4);
    assert!(!snapshot.children.iter().any(|c| c.contains("exclude")));
    assert_eq!(snapshot.names(), vec!["1", "2", "3", "4"]);
}

#[tokio::test]
async fn get_children_should_not_match_sibling_with_common_prefix() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);
    store.create_persistent("/app/x").await.unwrap();
    store.create_persistent("/apple/y").await.unwrap();

    let snapshot = store.get_children("/app").await.unwrap();

    assert_eq!(snapshot.children, vec!["/app/x".to_string()]);
}

#[tokio::test]
async fn create_persistent_should_be_idempotent() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);

    store.create_persistent("/p").await.unwrap();
    let revision = backend.revision();
    store.create_persistent("/p").await.unwrap();

    assert_eq!(backend.revision(), revision);
    assert!(store.check_exists("/p").await.unwrap());
}

#[tokio::test]
async fn create_ephemeral_should_bind_the_session_lease() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);

    store.create_ephemeral("/e").await.unwrap();
    let lease_id = backend.key_lease("/e").unwrap();

    backend.expire_lease(lease_id);
    assert!(!store.check_exists("/e").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn create_ephemeral_should_fail_after_repeated_keepalive_failures() {
    let backend = MemoryBackend::new();
    let mut strategy = MockKeepAliveStrategy::new();
    strategy.expect_keep_alive().returning(|_| {
        Err(Error::Connection {
            operation: "keepalive",
            source: Status::unavailable("injected keepalive failure"),
        })
    });
    let store = key_store_with(&backend, Arc::new(strategy), 1000);

    store.create_ephemeral("/dubbo/svc/providers/first").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let path = "/dubbo/svc/providers/second";
    let err = store.create_ephemeral(path).await.unwrap_err();
    assert_eq!(err.to_string(), format!("failed to create ephemeral by path '{path}'"));
}

#[tokio::test]
async fn create_ephemeral_should_wrap_connection_failures() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);
    backend.set_available(false);

    let err = store.create_ephemeral("/e").await.unwrap_err();

    assert!(err.is_connection_error());
    assert_eq!(err.to_string(), "failed to create ephemeral by path '/e'");
}

#[tokio::test]
async fn delete_of_missing_key_should_succeed() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);

    assert!(store.delete("/missing").await.is_ok());
}

#[tokio::test]
async fn closed_store_should_reject_operations() {
    let backend = MemoryBackend::new();
    let store = key_store(&backend);
    store.close();

    let err = store.get_children("/a").await.unwrap_err();

    assert_eq!(err.to_string(), "kv client has been closed, path '/a'");
}

#[tokio::test]
async fn put_against_vanished_lease_should_report_lease_expiry() {
    let mut backend = MockKvBackend::new();
    backend.expect_grant_lease().returning(|_| Ok(7));
    backend
        .expect_put()
        .returning(|_, _, _| Err(Status::not_found("requested lease not found")));
    let kv: Arc<dyn KvBackend> = Arc::new(backend);
    let leases = Arc::new(LeaseManager::new(
        kv.clone(),
        Arc::new(MockKeepAliveStrategy::new()),
        LeaseConfig::default(),
        Duration::from_millis(500),
    ));
    let store = KeyStore::new(kv, leases, Duration::from_millis(500));

    let err = store.create_ephemeral("/e").await.unwrap_err();

    match err {
        Error::Creation { path, source } => {
            assert_eq!(path, "/e");
            assert!(matches!(*source, Error::LeaseExpired(7)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn immediate_child_rule() {
    assert!(is_immediate_child("/a", "/a/1"));
    assert!(is_immediate_child("/a/", "/a/1"));
    assert!(!is_immediate_child("/a", "/a/5/exclude"));
    assert!(!is_immediate_child("/a", "/a/"));
    assert!(!is_immediate_child("/a", "/ab/1"));
    assert_eq!(child_name("/a/b/c"), "c");
}
