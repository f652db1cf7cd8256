use std::time::Duration;

use etcd_registry::MemoryBackend;
use etcd_registry::RegistryConfig;
use etcd_registry::WatchState;
use tonic::Status;

use crate::common::child_recorder;
use crate::common::memory_client;
use crate::common::wait_until;

const PROVIDERS: &str = "/dubbo/org.example.Greeter/providers";

#[tokio::test]
async fn test_get_children_excludes_grandchildren() {
    let backend = MemoryBackend::new();
    let client = memory_client(&backend, RegistryConfig::default()).await;

    for key in ["a/1", "a/2", "a/3", "a/4", "a/5/exclude"] {
        client.create_persistent(&format!("/{key}")).await.unwrap();
    }

    let children = client.get_children("/a").await.unwrap();
    assert_eq!(children, vec!["/a/1", "/a/2", "/a/3", "/a/4"]);
}

#[tokio::test]
async fn test_recoverable_failure_then_delete_yields_two_callbacks() {
    let backend = MemoryBackend::new();
    let client = memory_client(&backend, RegistryConfig::default()).await;
    let (listener, calls) = child_recorder();
    let node = format!("{PROVIDERS}/node-1");

    client.add_child_listener(PROVIDERS, listener.clone()).await.unwrap();
    client.create_ephemeral(&node).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || calls.lock().len() == 1).await);

    let watcher = client.get_child_listener(PROVIDERS, &listener).await.unwrap();
    watcher.fail_stream(Status::unavailable("connection reset"));
    client.delete(&node).await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || calls.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], vec!["node-1"]);
    assert!(calls[1].is_empty());
    assert_eq!(watcher.state(), WatchState::Active);
}

#[tokio::test]
async fn test_unrecoverable_failure_cancels_the_next_request() {
    let backend = MemoryBackend::new();
    let client = memory_client(&backend, RegistryConfig::default()).await;
    let (listener, calls) = child_recorder();

    client.add_child_listener(PROVIDERS, listener.clone()).await.unwrap();
    let watcher = client.get_child_listener(PROVIDERS, &listener).await.unwrap();
    watcher.fail_stream(Status::aborted("watch request aborted by server"));

    let err = watcher.send_next_request().await.unwrap_err();
    assert!(err.to_string().contains("call was cancelled"), "{err}");
    assert_eq!(watcher.state(), WatchState::Cancelled);

    client
        .create_ephemeral(&format!("{PROVIDERS}/node-1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_add_child_listener_after_close_fails() {
    let backend = MemoryBackend::new();
    let client = memory_client(&backend, RegistryConfig::default()).await;
    let (listener, _calls) = child_recorder();

    client.close().await;

    let err = client
        .add_child_listener(PROVIDERS, listener.clone())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("watch client has been closed, path '{PROVIDERS}'")
    );
    assert!(client.get_child_listener(PROVIDERS, &listener).await.is_none());
    assert!(client.watches().watched_paths().await.is_empty());
}
