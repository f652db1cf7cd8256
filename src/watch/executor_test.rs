use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::executor::NotifyExecutor;

fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

#[test]
fn jobs_of_one_shard_should_run_in_submission_order() {
    let executor = NotifyExecutor::new(4, 1024).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..50 {
        let seen = seen.clone();
        assert!(executor.submit(7, Box::new(move || seen.lock().push(i))));
    }

    wait_until(|| seen.lock().len() == 50);
    assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
}

#[test]
fn full_queue_should_drop_new_jobs() {
    let executor = NotifyExecutor::new(1, 2).unwrap();
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    assert!(executor.submit(0, Box::new(move || {
        let _ = release_rx.recv();
    })));
    assert!(executor.submit(0, Box::new(|| {})));
    assert!(!executor.submit(0, Box::new(|| {})));

    drop(release_tx);
    wait_until(|| executor.pending() == 0);
    assert!(executor.submit(0, Box::new(|| {})));
}

#[test]
fn panicking_job_should_not_kill_the_worker() {
    let executor = NotifyExecutor::new(1, 16).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    executor.submit(0, Box::new(|| panic!("listener bug")));
    let counter = ran.clone();
    executor.submit(
        0,
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    wait_until(|| ran.load(Ordering::SeqCst) == 1);
}

#[test]
fn shutdown_should_reject_new_jobs() {
    let executor = NotifyExecutor::new(2, 16).unwrap();

    executor.shutdown();

    assert!(!executor.submit(0, Box::new(|| {})));
}
