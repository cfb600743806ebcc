// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Keyed serialization primitive (§4.1): FIFO mutual exclusion per string key.
//!
//! `target`/`job`/`device`/bootstrap locks throughout `kahlo-engine` are all
//! instances of this one primitive, keyed by a caller-chosen string such as
//! `"ensure:<device_id>:<package>"` or `"bootstrap:<target_id>"`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

/// A mapping from string key to a FIFO chain of pending holders.
///
/// Registration under a key is synchronous (the map entry is created and
/// the caller's place in the chain is established before any `.await`
/// point), which is what prevents two callers that observe an empty chain
/// from both proceeding. The primitive is fair (tokio's internal semaphore
/// queues waiters in arrival order) but not re-entrant: awaiting a second
/// `with_lock` on the same key from a task that already holds it deadlocks
/// by design.
#[derive(Default)]
pub struct KeyedLock {
    chains: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self { chains: SyncMutex::new(HashMap::new()) }
    }

    /// Run `action` with exclusive access to `key`. At most one invocation
    /// per key runs at a time; waiters for the same key observe arrival
    /// order. After the call returns, if no other waiter chained onto this
    /// key in the meantime, the key entry is removed from the map.
    pub async fn with_lock<F, Fut, T>(&self, key: impl Into<String>, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = key.into();
        let chain = {
            let mut chains = self.chains.lock();
            chains.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };

        let guard = chain.lock().await;
        let result = action().await;
        drop(guard);

        {
            let mut chains = self.chains.lock();
            // `chains` holds one Arc, `chain` (this call's local) holds the other.
            // If strong_count is still 2, nobody chained onto this key while we
            // held it, so it is safe to drop the entry.
            if Arc::strong_count(&chain) == 2 {
                chains.remove(&key);
            }
        }

        result
    }

    /// Number of distinct keys with an active or pending chain. Test/introspection only.
    pub fn active_key_count(&self) -> usize {
        self.chains.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_key() {
        let lock = Arc::new(KeyedLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("k", || async {
                    let cur = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(cur, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let lock = Arc::new(KeyedLock::new());
        let start = std::time::Instant::now();
        let a = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_lock("a", || async { tokio::time::sleep(Duration::from_millis(30)).await }).await;
            })
        };
        let b = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_lock("b", || async { tokio::time::sleep(Duration::from_millis(30)).await }).await;
            })
        };
        a.await.unwrap();
        b.await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(55));
    }

    #[tokio::test]
    async fn key_removed_after_chain_drains() {
        let lock = KeyedLock::new();
        lock.with_lock("k", || async {}).await;
        assert_eq!(lock.active_key_count(), 0);
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let lock = Arc::new(KeyedLock::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));

        // Hold the lock first so subsequent spawns queue up in arrival order.
        let holder_lock = lock.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let holder = tokio::spawn(async move {
            holder_lock
                .with_lock("k", || async move {
                    rx.await.ok();
                })
                .await;
        });
        tokio::task::yield_now().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("k", || async { order.lock().push(i) }).await;
            }));
            tokio::task::yield_now().await;
        }

        tx.send(()).ok();
        holder.await.unwrap();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }
}
