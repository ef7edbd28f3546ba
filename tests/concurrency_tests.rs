//! Concurrency Tests
//!
//! Several producer threads share one live cache; expiry runs on real
//! tokio timers racing upstream removals.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactive_cache::testing::ChangeSetAggregator;
use reactive_cache::{Expiry, Scheduler, SourceCache, TokioScheduler};

const THREADS: u32 = 8;
const OPS_PER_THREAD: u32 = 500;

// == Helper Functions ==

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

// == Shared Cache Tests ==

#[test]
fn test_concurrent_producers_keep_subscribers_consistent() {
    let cache = Arc::new(SourceCache::new(|v: &(u32, u32)| v.0));
    let results = ChangeSetAggregator::new(&cache.connect());

    let producers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for op in 0..OPS_PER_THREAD {
                    // Keys overlap across threads so edits contend
                    let key = op % 64;
                    if op % 3 == 0 {
                        cache.remove_key(&key).unwrap();
                    } else {
                        cache.add_or_update((key, thread_id * OPS_PER_THREAD + op)).unwrap();
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let expected: HashMap<u32, (u32, u32)> = cache.key_values().into_iter().collect();
    assert_eq!(results.data(), expected);

    let summary = results.summary();
    assert_eq!(summary.adds - summary.removes, cache.count());
}

#[test]
fn test_concurrent_edit_batches_stay_atomic() {
    let cache = Arc::new(SourceCache::new(|v: &(u32, u32)| v.0));
    let results = ChangeSetAggregator::new(&cache.connect());

    let producers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..50 {
                    let base = thread_id * 1000 + round * 4;
                    cache
                        .edit(|updater| {
                            for key in base..base + 4 {
                                updater.add_or_update((key, round));
                            }
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let messages = results.messages();
    assert_eq!(messages.len(), (THREADS * 50) as usize);
    assert!(messages.iter().all(|batch| batch.adds() == 4));
    assert_eq!(results.data().len(), cache.count());
}

// == Real-Time Expiry Tests ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timer_racing_upstream_remove_emits_one_remove() {
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current().unwrap());
    let cache = Arc::new(SourceCache::new(|v: &(u32, u64)| v.0));
    let expiring = cache
        .connect()
        .expire_after(|v: &(u32, u64)| Ok(Expiry::After(ms(v.1))), None, scheduler)
        .unwrap();
    let results = ChangeSetAggregator::new(&expiring);

    let producers: Vec<_> = (0..4u32)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            tokio::task::spawn_blocking(move || {
                for op in 0..100u32 {
                    let key = thread_id * 1000 + op;
                    cache.add_or_update((key, 2 + u64::from(op % 6))).unwrap();
                    if op % 2 == 1 {
                        // Lands before, on, or after the previous key's deadline
                        thread::sleep(ms(u64::from(op % 5)));
                        cache.remove_key(&(key - 1)).unwrap();
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    tokio::time::sleep(ms(200)).await;

    let summary = results.summary();
    assert_eq!(summary.adds, 400);
    assert_eq!(summary.removes, 400);
    assert_eq!(summary.updates, 0);
    assert!(results.data().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_source_expiry_under_concurrent_edits_drains_cache() {
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current().unwrap());
    let cache = Arc::new(SourceCache::new(|v: &(u32, u64)| v.0));
    let contents = ChangeSetAggregator::new(&cache.connect());
    let expiry = cache
        .expire_after(|v: &(u32, u64)| Ok(Expiry::After(ms(v.1))), Some(ms(5)), scheduler)
        .unwrap();
    let expired = ChangeSetAggregator::new(&expiry);

    let producers: Vec<_> = (0..4u32)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            tokio::task::spawn_blocking(move || {
                for op in 0..50u32 {
                    let key = thread_id * 1000 + op;
                    cache.add_or_update((key, 3 + u64::from(op % 10))).unwrap();
                    if op % 4 == 3 {
                        cache.remove_key(&(key - 2)).unwrap();
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    tokio::time::sleep(ms(200)).await;

    assert_eq!(cache.count(), 0);
    assert!(contents.data().is_empty());
    assert_eq!(contents.summary().adds, 200);
    assert_eq!(contents.summary().removes, 200);
    // Producers remove a quarter of the keys; expiry removes the rest, plus
    // any of that quarter it reached first
    let removed_by_expiry = expired.summary().removes;
    assert!((150..=200).contains(&removed_by_expiry));
}
