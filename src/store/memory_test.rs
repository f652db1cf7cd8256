use std::time::Duration;

use futures::StreamExt;
use tonic::Code;
use tonic::Status;

use super::*;

#[tokio::test]
async fn range_prefix_should_return_keys_in_order_at_current_revision() {
    let store = MemoryBackend::new();
    store.put("/a/2", vec![], None).await.unwrap();
    store.put("/a/1", vec![], None).await.unwrap();
    store.put("/b/1", vec![], None).await.unwrap();

    let snapshot = store.range_prefix("/a/").await.unwrap();

    assert_eq!(snapshot.keys, vec!["/a/1".to_string(), "/a/2".to_string()]);
    assert_eq!(snapshot.revision, 3);
}

#[tokio::test]
async fn delete_of_missing_key_should_succeed_without_new_revision() {
    let store = MemoryBackend::new();
    store.put("/a", vec![], None).await.unwrap();

    store.delete("/missing").await.unwrap();

    assert_eq!(store.revision(), 1);
    assert!(store.exists("/a").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn lease_expiry_should_delete_bound_keys() {
    let store = MemoryBackend::new();
    let lease = store.grant_lease(1).await.unwrap();
    store.put("/eph", vec![], Some(lease)).await.unwrap();
    store.put("/persistent", vec![], None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!store.exists("/eph").await.unwrap());
    assert!(store.exists("/persistent").await.unwrap());
    let err = store.keep_alive_once(lease).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_should_push_the_deadline_forward() {
    let store = MemoryBackend::new();
    let lease = store.grant_lease(2).await.unwrap();
    store.put("/eph", vec![], Some(lease)).await.unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.keep_alive_once(lease).await.unwrap(), 2);
    }

    assert!(store.exists("/eph").await.unwrap());
}

#[tokio::test]
async fn put_with_unknown_lease_should_fail() {
    let store = MemoryBackend::new();

    let err = store.put("/eph", vec![], Some(42)).await.unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
    assert!(!store.exists("/eph").await.unwrap());
}

#[tokio::test]
async fn watch_should_replay_history_from_start_revision() {
    let store = MemoryBackend::new();
    store.put("/w/a", vec![], None).await.unwrap();
    store.put("/other", vec![], None).await.unwrap();
    store.put("/w/b", vec![], None).await.unwrap();

    let mut stream = store.watch_prefix("/w/", 2).await.unwrap();
    let batch = stream.events.next().await.unwrap().unwrap();

    assert_eq!(batch.revision, 3);
    assert_eq!(
        batch.events,
        vec![KeyEvent {
            kind: EventKind::Put,
            key: "/w/b".to_string()
        }]
    );
}

#[tokio::test]
async fn watch_should_deliver_live_changes_under_prefix_only() {
    let store = MemoryBackend::new();
    let mut stream = store.watch_prefix("/w/", store.revision() + 1).await.unwrap();

    store.put("/other", vec![], None).await.unwrap();
    store.put("/w/a", vec![], None).await.unwrap();
    store.delete("/w/a").await.unwrap();

    let first = stream.events.next().await.unwrap().unwrap();
    let second = stream.events.next().await.unwrap().unwrap();
    assert_eq!(first.events[0].kind, EventKind::Put);
    assert_eq!(second.events[0].kind, EventKind::Delete);
    assert_eq!(second.revision, 3);
}

#[tokio::test]
async fn injected_watch_failure_should_reach_open_streams() {
    let store = MemoryBackend::new();
    let mut stream = store.watch_prefix("/w/", 1).await.unwrap();

    store.fail_watches(Status::unavailable("connection reset"));

    let err = stream.events.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn cancelled_watch_should_reject_progress_requests() {
    let store = MemoryBackend::new();
    let mut stream = store.watch_prefix("/w/", 1).await.unwrap();
    stream.control.request_progress().await.unwrap();

    stream.control.cancel().await.unwrap();

    let err = stream.control.request_progress().await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    assert!(err.message().contains("call was cancelled"));
    assert!(stream.events.next().await.is_none());
}

#[tokio::test]
async fn unavailable_store_should_fail_every_call() {
    let store = MemoryBackend::new();
    store.set_available(false);

    assert!(!store.is_connected());
    assert_eq!(store.grant_lease(10).await.unwrap_err().code(), Code::Unavailable);
    assert_eq!(
        store.put("/a", vec![], None).await.unwrap_err().code(),
        Code::Unavailable
    );

    store.set_available(true);
    assert!(store.put("/a", vec![], None).await.is_ok());
}

#[tokio::test]
async fn expire_lease_should_emit_delete_events() {
    let store = MemoryBackend::new();
    let lease = store.grant_lease(60).await.unwrap();
    store.put("/w/eph", vec![], Some(lease)).await.unwrap();
    let mut stream = store.watch_prefix("/w/", store.revision() + 1).await.unwrap();

    assert!(store.expire_lease(lease));

    let batch = stream.events.next().await.unwrap().unwrap();
    assert_eq!(batch.events[0].kind, EventKind::Delete);
    assert!(store.lease_ids().is_empty());
    assert!(!store.expire_lease(lease));
}

#[tokio::test]
async fn rejected_watches_should_answer_the_injected_status() {
    let store = MemoryBackend::new();
    store.reject_watches(Some(Status::permission_denied("watch not permitted")));

    let err = store.watch_prefix("/w/", 1).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    store.reject_watches(None);
    assert!(store.watch_prefix("/w/", 1).await.is_ok());
}

#[tokio::test]
async fn put_should_keep_the_latest_value() {
    let store = MemoryBackend::new();
    store.put("/a", b"first".to_vec(), None).await.unwrap();
    store.put("/a", b"second".to_vec(), None).await.unwrap();

    assert_eq!(store.value("/a"), Some(b"second".to_vec()));
    assert_eq!(store.value("/missing"), None);
}
