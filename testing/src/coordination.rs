//! In-memory coordination store.
//!
//! Same re-entrant hold-count semantics as the Redis store, kept in a
//! `HashMap` behind a mutex. Waiting is a spin with a short sleep, so the
//! store behaves like the real one under contention without any server.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storefront_core::coordination::{
    CoordinationFuture, CoordinationStore, HolderId, LockToken,
};

#[derive(Debug)]
struct Entry {
    holder: HolderId,
    count: u32,
    expires_at: Instant,
}

#[derive(Debug)]
struct Inner {
    locks: Mutex<HashMap<String, Entry>>,
    spin_interval: Duration,
    acquire_calls: AtomicUsize,
}

/// In-memory [`CoordinationStore`] for tests and single-process runs.
///
/// # Example
///
/// ```
/// use storefront_testing::InMemoryCoordinationStore;
/// use storefront_core::coordination::{CoordinationStore, HolderId};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCoordinationStore::new();
/// let holder = HolderId::new("node", "chain");
///
/// let token = store
///     .try_acquire("lock:product:1", &holder, Duration::ZERO, Duration::from_secs(5))
///     .await?
///     .expect("free key is granted");
/// assert!(store.is_locked("lock:product:1"));
///
/// store.release(&token).await?;
/// assert!(!store.is_locked("lock:product:1"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryCoordinationStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    /// Create an empty store polling every 5ms while waiting.
    #[must_use]
    pub fn new() -> Self {
        Self::with_spin_interval(Duration::from_millis(5))
    }

    /// Create an empty store with a custom polling interval.
    #[must_use]
    pub fn with_spin_interval(spin_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                locks: Mutex::new(HashMap::new()),
                spin_interval: spin_interval.max(Duration::from_millis(1)),
                acquire_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of `try_acquire` calls received.
    #[must_use]
    pub fn acquire_calls(&self) -> usize {
        self.inner.acquire_calls.load(Ordering::SeqCst)
    }

    /// True if `key` is held and its lease has not run out.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .locks
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Current owner of `key`, if any.
    #[must_use]
    pub fn holder_of(&self, key: &str) -> Option<HolderId> {
        let now = Instant::now();
        self.inner
            .locks
            .lock()
            .unwrap()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder.clone())
    }

    /// Number of live keys.
    #[must_use]
    pub fn locked_keys(&self) -> usize {
        let now = Instant::now();
        self.inner
            .locks
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Force the lease of `key` to run out, simulating a crashed holder.
    pub fn expire(&self, key: &str) {
        if let Some(entry) = self.inner.locks.lock().unwrap().get_mut(key) {
            entry.expires_at = Instant::now();
        }
    }

    fn try_take(&self, key: &str, holder: &HolderId, lease: Duration) -> bool {
        let mut locks = self.inner.locks.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = locks.get_mut(key) {
            if entry.expires_at > now {
                if entry.holder != *holder {
                    return false;
                }
                entry.count += 1;
                entry.expires_at = entry.expires_at.max(now + lease);
                return true;
            }
        }
        locks.insert(
            key.to_string(),
            Entry {
                holder: holder.clone(),
                count: 1,
                expires_at: now + lease,
            },
        );
        true
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &HolderId,
        wait: Duration,
        lease: Duration,
    ) -> CoordinationFuture<'_, Option<LockToken>> {
        let key = key.to_string();
        let holder = holder.clone();
        Box::pin(async move {
            self.inner.acquire_calls.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + wait;
            loop {
                if self.try_take(&key, &holder, lease) {
                    return Ok(Some(LockToken::new(key, holder)));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(self.inner.spin_interval.min(deadline - now)).await;
            }
        })
    }

    fn release(&self, token: &LockToken) -> CoordinationFuture<'_, u32> {
        let token = token.clone();
        Box::pin(async move {
            let mut locks = self.inner.locks.lock().unwrap();
            let now = Instant::now();
            let Some(entry) = locks.get_mut(token.key()) else {
                return Ok(0);
            };
            if entry.expires_at <= now {
                locks.remove(token.key());
                return Ok(0);
            }
            if entry.holder != *token.holder() {
                return Ok(0);
            }
            entry.count = entry.count.saturating_sub(1);
            let remaining = entry.count;
            if remaining == 0 {
                locks.remove(token.key());
            }
            Ok(remaining)
        })
    }

    fn extend_lease(&self, token: &LockToken, lease: Duration) -> CoordinationFuture<'_, bool> {
        let token = token.clone();
        Box::pin(async move {
            let mut locks = self.inner.locks.lock().unwrap();
            let now = Instant::now();
            match locks.get_mut(token.key()) {
                Some(entry) if entry.expires_at > now && entry.holder == *token.holder() => {
                    entry.expires_at = now + lease;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn hold_count(&self, key: &str, holder: &HolderId) -> CoordinationFuture<'_, u32> {
        let key = key.to_string();
        let holder = holder.clone();
        Box::pin(async move {
            let now = Instant::now();
            Ok(self
                .inner
                .locks
                .lock()
                .unwrap()
                .get(&key)
                .filter(|entry| entry.expires_at > now && entry.holder == holder)
                .map_or(0, |entry| entry.count))
        })
    }
}
