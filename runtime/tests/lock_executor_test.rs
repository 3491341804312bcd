//! Behavioral tests for [`LockExecutor`] against the in-memory coordination store.
//!
//! Run with: `cargo test -p storefront-runtime --test lock_executor_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use storefront_core::coordination::{CoordinationStore, HolderId};
use storefront_core::lock::LockRequestSet;
use storefront_runtime::{LockError, LockExecutor, LockOptions};
use storefront_testing::{InMemoryCoordinationStore, init_test_tracing};
use thiserror::Error;

#[derive(Debug, Error)]
enum TestError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("business rule failed")]
    Business,
}

fn setup() -> (InMemoryCoordinationStore, LockExecutor) {
    init_test_tracing();
    let store = InMemoryCoordinationStore::new();
    let executor = LockExecutor::new(Arc::new(store.clone())).with_defaults(
        LockOptions::default().with_wait_time(Duration::from_secs(10)),
    );
    (store, executor)
}

fn keys(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|k| (*k).to_string()).collect()
}

/// Tracks how many actions are inside a critical section at once.
#[derive(Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    async fn visit(&self, stay: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(stay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_is_mutually_exclusive() {
    let (store, executor) = setup();
    let occupancy = Arc::new(Occupancy::default());

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let executor = executor.clone();
            let occupancy = Arc::clone(&occupancy);
            tokio::spawn(async move {
                executor
                    .run(&keys(&["lock:product:1"]), || async {
                        occupancy.visit(Duration::from_millis(5)).await;
                        Ok::<_, LockError>(())
                    })
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(occupancy.peak(), 1);
    assert_eq!(store.locked_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_keys_run_in_parallel() {
    let (_store, executor) = setup();
    let occupancy = Arc::new(Occupancy::default());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let executor = executor.clone();
            let occupancy = Arc::clone(&occupancy);
            tokio::spawn(async move {
                executor
                    .run(&[format!("lock:product:{i}")], || async {
                        occupancy.visit(Duration::from_millis(100)).await;
                        Ok::<_, LockError>(())
                    })
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert!(occupancy.peak() > 1, "peak concurrency was {}", occupancy.peak());
}

#[tokio::test]
async fn nested_run_on_same_task_reenters() {
    let (store, executor) = setup();
    let wallet = "lock:point:user:1".to_string();

    executor
        .run(&[wallet.clone()], || async {
            assert_eq!(executor.hold_count(&wallet).await?, 1);

            executor
                .run(&keys(&["lock:point:user:1", "lock:product:7"]), || async {
                    assert_eq!(executor.hold_count(&wallet).await?, 2);
                    assert_eq!(executor.hold_count("lock:product:7").await?, 1);
                    Ok::<_, LockError>(())
                })
                .await?;

            assert_eq!(executor.hold_count(&wallet).await?, 1);
            assert!(!store.is_locked("lock:product:7"));
            assert!(store.is_locked(&wallet));
            Ok::<_, LockError>(())
        })
        .await
        .unwrap();

    assert!(!store.is_locked(&wallet));
    assert!(executor.current_holder().is_none());
}

#[tokio::test]
async fn spawned_task_is_a_different_holder() {
    let (store, executor) = setup();
    let key = keys(&["lock:coupon:user:5"]);

    executor
        .run(&key, || async {
            let inner = executor.clone();
            let inner_key = key.clone();
            let denied = tokio::spawn(async move {
                inner
                    .run_with(
                        &inner_key,
                        LockOptions::default().with_wait_time(Duration::from_millis(50)),
                        || async { Ok::<_, LockError>(()) },
                    )
                    .await
            })
            .await
            .unwrap();

            assert!(matches!(denied, Err(LockError::AcquisitionTimeout { .. })));
            Ok::<_, LockError>(())
        })
        .await
        .unwrap();

    assert_eq!(store.locked_keys(), 0);
}

#[tokio::test]
async fn action_error_releases_locks() {
    let (store, executor) = setup();

    let result: Result<(), TestError> = executor
        .run(&keys(&["lock:product:1", "lock:product:2"]), || async {
            Err(TestError::Business)
        })
        .await;

    assert!(matches!(result, Err(TestError::Business)));
    assert_eq!(store.locked_keys(), 0);
}

#[tokio::test]
async fn action_panic_releases_locks_and_propagates() {
    let (store, executor) = setup();

    let handle = tokio::spawn(async move {
        executor
            .run(&keys(&["lock:product:1"]), || async {
                if std::hint::black_box(true) {
                    panic!("boom");
                }
                Ok::<(), LockError>(())
            })
            .await
    });

    let join = handle.await;
    assert!(join.unwrap_err().is_panic());
    assert!(!store.is_locked("lock:product:1"));
}

#[tokio::test]
async fn timeout_releases_keys_already_taken() {
    let (store, executor) = setup();
    let rival = HolderId::new("other-node", "chain");
    store
        .try_acquire("lock:product:2", &rival, Duration::ZERO, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let ran = AtomicUsize::new(0);
    let result = executor
        .run_with(
            &keys(&["lock:product:1", "lock:product:2"]),
            LockOptions::default().with_wait_time(Duration::from_millis(60)),
            || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            },
        )
        .await;

    match result {
        Err(TestError::Lock(LockError::AcquisitionTimeout { key, waited })) => {
            assert_eq!(key, "lock:product:2");
            assert!(waited >= Duration::from_millis(60));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(!store.is_locked("lock:product:1"));
    assert_eq!(store.holder_of("lock:product:2"), Some(rival));
}

#[tokio::test]
async fn empty_key_set_bypasses_store() {
    let (store, executor) = setup();

    let value = executor
        .run(&[], || async { Ok::<_, LockError>(42) })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(store.acquire_calls(), 0);
}

#[tokio::test]
async fn cancelled_run_releases_in_background() {
    let (store, executor) = setup();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        executor.run(&keys(&["lock:product:9"]), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, LockError>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    for _ in 0..50 {
        if !store.is_locked("lock:product:9") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cancelled lock was never released");
}

#[tokio::test]
async fn watchdog_keeps_short_lease_alive() {
    let (store, executor) = setup();
    let options = LockOptions::new(Duration::from_secs(1), Duration::from_millis(60));

    executor
        .run_with(&keys(&["lock:product:3"]), options, || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(store.is_locked("lock:product:3"));
            Ok::<_, LockError>(())
        })
        .await
        .unwrap();

    assert!(!store.is_locked("lock:product:3"));
}

#[tokio::test]
async fn lease_expires_without_watchdog() {
    let (store, executor) = setup();
    let options = LockOptions::new(Duration::from_secs(1), Duration::from_millis(40))
        .with_auto_extend(false);

    executor
        .run_with(&keys(&["lock:product:4"]), options, || async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(!store.is_locked("lock:product:4"));
            Ok::<_, LockError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn nested_short_lease_keeps_outer_lease() {
    let (store, executor) = setup();
    let outer = LockOptions::new(Duration::from_secs(1), Duration::from_secs(2))
        .with_auto_extend(false);
    let inner = LockOptions::new(Duration::from_secs(1), Duration::from_millis(40))
        .with_auto_extend(false);
    let key = keys(&["lock:point:user:1"]);

    executor
        .run_with(&key, outer, || async {
            executor
                .run_with(&key, inner, || async { Ok::<_, LockError>(()) })
                .await?;

            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(store.is_locked("lock:point:user:1"));
            let rival = store
                .try_acquire(
                    "lock:point:user:1",
                    &HolderId::new("other-instance", 1),
                    Duration::ZERO,
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            assert!(rival.is_none());
            Ok::<_, LockError>(())
        })
        .await
        .unwrap();

    assert!(!store.is_locked("lock:point:user:1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_sorted_sets_never_deadlock() {
    let (store, executor) = setup();

    let forward = LockRequestSet::new()
        .with_wallet(1)
        .with_products([10, 20])
        .build_sorted_keys();
    let backward = LockRequestSet::new()
        .with_products([20, 10])
        .with_wallet(1)
        .build_sorted_keys();
    assert_eq!(forward, backward);

    let completed = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let executor = executor.clone();
            let completed = Arc::clone(&completed);
            let keys = if i % 2 == 0 { forward.clone() } else { backward.clone() };
            tokio::spawn(async move {
                executor
                    .run(&keys, || async {
                        tokio::task::yield_now().await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, LockError>(())
                    })
                    .await
            })
        })
        .collect();

    let results = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("lock sets deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 20);
    assert_eq!(store.locked_keys(), 0);
}
