//! Distributed multi-key lock executor.
//!
//! [`LockExecutor::run`] acquires every key of a lock set from a
//! [`CoordinationStore`], runs an action while holding them, and releases them
//! in reverse acquisition order on every exit path.
//!
//! # Acquisition
//!
//! Keys are taken one at a time in the order given, all sharing a single
//! deadline of `start + wait_time`. If any key is still busy at the deadline,
//! the keys already taken by this call are released and
//! [`LockError::AcquisitionTimeout`] is returned. Callers pass the output of
//! `LockRequestSet::build_sorted_keys` so overlapping lock sets are always
//! taken in the same order.
//!
//! # Re-entrancy
//!
//! The outermost `run` on a task opens a call chain. Nested `run`s on the same
//! task reuse it, so the store sees the same holder and grants keys the chain
//! already owns immediately, bumping their hold count. A spawned task starts
//! its own chain and is a different holder.
//!
//! ```text
//! run([wallet:1, product:7])           hold(wallet:1) = 1
//!   └─ run([wallet:1])                 hold(wallet:1) = 2, no waiting
//!      └─ returns                      hold(wallet:1) = 1
//! returns                              wallet:1 removed
//! ```
//!
//! # Release
//!
//! Locks are released after a normal return, after an error, after a panic
//! (the panic is resumed once the locks are gone) and when the `run` future is
//! dropped mid-action (release is spawned onto the runtime).
//!
//! # Leases
//!
//! Every key carries a lease so a crashed holder cannot block others forever.
//! With `auto_extend` enabled, a watchdog renews the leases every
//! `lease_time / 3` while the action runs.

use crate::metrics::LockMetrics;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storefront_core::coordination::{CoordinationError, CoordinationStore, HolderId, LockToken};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

tokio::task_local! {
    static CALL_CHAIN: Uuid;
}

/// Default time to wait for a whole lock set.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_millis(3000);

/// Default lease per key.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_millis(5000);

/// Errors raised while acquiring a lock set.
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// A key was still held by someone else when the wait time ran out.
    #[error("Timed out after {waited:?} waiting for lock '{key}'")]
    AcquisitionTimeout {
        /// The key that could not be taken
        key: String,
        /// Time spent on the whole lock set
        waited: Duration,
    },

    /// The coordination store failed.
    #[error("Lock store failure: {0}")]
    Store(#[from] CoordinationError),
}

impl LockError {
    /// True for [`LockError::AcquisitionTimeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquisitionTimeout { .. })
    }
}

/// Timing options for one lock set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Maximum time to wait for the whole key set.
    pub wait_time: Duration,
    /// Lease set on each key.
    pub lease_time: Duration,
    /// Renew leases while the action runs.
    pub auto_extend: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIME, DEFAULT_LEASE_TIME)
    }
}

impl LockOptions {
    /// Options with auto-extension enabled.
    #[must_use]
    pub const fn new(wait_time: Duration, lease_time: Duration) -> Self {
        Self {
            wait_time,
            lease_time,
            auto_extend: true,
        }
    }

    /// Set the wait time.
    #[must_use]
    pub const fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Set the lease time.
    #[must_use]
    pub const fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    /// Enable or disable lease renewal.
    #[must_use]
    pub const fn with_auto_extend(mut self, auto_extend: bool) -> Self {
        self.auto_extend = auto_extend;
        self
    }
}

/// Runs actions while holding a set of distributed locks.
///
/// Cheap to clone; clones share the coordination store and instance id.
///
/// # Example
///
/// ```rust,ignore
/// let keys = LockRequestSet::new().with_wallet(user).with_products(ids).build_sorted_keys();
///
/// let order = executor
///     .run(&keys, || async {
///         // every key in `keys` is held here
///         place_order().await
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct LockExecutor {
    store: Arc<dyn CoordinationStore>,
    instance_id: Arc<str>,
    defaults: LockOptions,
}

impl std::fmt::Debug for LockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockExecutor")
            .field("instance_id", &self.instance_id)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl LockExecutor {
    /// Create an executor with a fresh instance id and default options.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            instance_id: Arc::from(Uuid::new_v4().to_string()),
            defaults: LockOptions::default(),
        }
    }

    /// Replace the options used by [`run`](Self::run).
    #[must_use]
    pub const fn with_defaults(mut self, defaults: LockOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Options used by [`run`](Self::run).
    #[must_use]
    pub const fn defaults(&self) -> &LockOptions {
        &self.defaults
    }

    /// Identifier of this process in holder ids.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Holder id of the current call chain, if this task is inside a `run`.
    #[must_use]
    pub fn current_holder(&self) -> Option<HolderId> {
        CALL_CHAIN
            .try_with(|chain| HolderId::new(&self.instance_id, chain))
            .ok()
    }

    /// How many times the current call chain holds `key`.
    ///
    /// Zero outside of `run` or when the key is not held.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] if the store cannot be reached.
    pub async fn hold_count(&self, key: &str) -> Result<u32, LockError> {
        match self.current_holder() {
            Some(holder) => Ok(self.store.hold_count(key, &holder).await?),
            None => Ok(0),
        }
    }

    /// Run `action` while holding `keys`, using the default options.
    ///
    /// # Errors
    ///
    /// Returns the action's error, or a [`LockError`] converted into `E` when
    /// the keys cannot be acquired.
    pub async fn run<T, E, F, Fut>(&self, keys: &[String], action: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.run_with(keys, self.defaults, action).await
    }

    /// Run `action` while holding `keys`.
    ///
    /// An empty key set runs `action` directly without touching the store.
    ///
    /// # Errors
    ///
    /// Returns the action's error, or a [`LockError`] converted into `E` when
    /// the keys cannot be acquired.
    pub async fn run_with<T, E, F, Fut>(
        &self,
        keys: &[String],
        options: LockOptions,
        action: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        if keys.is_empty() {
            tracing::warn!("No lock keys supplied, running action without locking");
            return action().await;
        }

        if let Ok(chain) = CALL_CHAIN.try_with(|chain| *chain) {
            self.run_locked(chain, keys, options, action).await
        } else {
            let chain = Uuid::new_v4();
            CALL_CHAIN
                .scope(chain, self.run_locked(chain, keys, options, action))
                .await
        }
    }

    async fn run_locked<T, E, F, Fut>(
        &self,
        chain: Uuid,
        keys: &[String],
        options: LockOptions,
        action: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let holder = HolderId::new(&self.instance_id, chain);
        let started = Instant::now();
        let deadline = started + options.wait_time;
        let mut held = HeldLocks::new(Arc::clone(&self.store));

        for key in keys {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .store
                .try_acquire(key, &holder, remaining, options.lease_time)
                .await
            {
                Ok(Some(token)) => {
                    tracing::debug!(key = %key, holder = %holder, "Lock acquired");
                    held.tokens.push(token);
                }
                Ok(None) => {
                    let waited = started.elapsed();
                    LockMetrics::record_timeout(waited);
                    tracing::warn!(
                        key = %key,
                        holder = %holder,
                        waited_ms = waited.as_millis(),
                        acquired = held.tokens.len(),
                        "Lock acquisition timed out"
                    );
                    held.release_all().await;
                    return Err(LockError::AcquisitionTimeout {
                        key: key.clone(),
                        waited,
                    }
                    .into());
                }
                Err(e) => {
                    LockMetrics::record_store_error();
                    tracing::error!(key = %key, holder = %holder, error = %e, "Lock store failed during acquisition");
                    held.release_all().await;
                    return Err(LockError::Store(e).into());
                }
            }
        }

        LockMetrics::record_acquired(started.elapsed());

        if options.auto_extend {
            held.watchdog = Some(spawn_watchdog(
                Arc::clone(&self.store),
                held.tokens.clone(),
                options.lease_time,
            ));
        }

        let acquired_at = Instant::now();
        let outcome = AssertUnwindSafe(async move { action().await })
            .catch_unwind()
            .await;
        held.release_all().await;
        LockMetrics::record_held(acquired_at.elapsed());

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(holder = %holder, "Action panicked while holding locks; locks released");
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Tokens taken by one `run`, released in reverse order.
struct HeldLocks {
    store: Arc<dyn CoordinationStore>,
    tokens: Vec<LockToken>,
    watchdog: Option<JoinHandle<()>>,
}

impl HeldLocks {
    const fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            tokens: Vec::new(),
            watchdog: None,
        }
    }

    async fn release_all(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        while let Some(token) = self.tokens.pop() {
            release_one(self.store.as_ref(), &token).await;
        }
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        if self.tokens.is_empty() {
            return;
        }

        let tokens = std::mem::take(&mut self.tokens);
        let store = Arc::clone(&self.store);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            tracing::warn!(
                count = tokens.len(),
                "Lock action cancelled, releasing locks in background"
            );
            runtime.spawn(async move {
                for token in tokens.iter().rev() {
                    release_one(store.as_ref(), token).await;
                }
            });
        } else {
            tracing::error!(
                count = tokens.len(),
                "No runtime to release cancelled locks; leases will expire"
            );
        }
    }
}

async fn release_one(store: &dyn CoordinationStore, token: &LockToken) {
    match store.release(token).await {
        Ok(remaining) => {
            tracing::debug!(key = token.key(), holder = %token.holder(), remaining, "Lock released");
        }
        Err(e) => {
            LockMetrics::record_store_error();
            tracing::warn!(
                key = token.key(),
                holder = %token.holder(),
                error = %e,
                "Failed to release lock; it will expire with its lease"
            );
        }
    }
}

fn spawn_watchdog(
    store: Arc<dyn CoordinationStore>,
    tokens: Vec<LockToken>,
    lease: Duration,
) -> JoinHandle<()> {
    let period = (lease / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            for token in &tokens {
                match store.extend_lease(token, lease).await {
                    Ok(true) => tracing::trace!(key = token.key(), "Lease extended"),
                    Ok(false) => {
                        LockMetrics::record_lease_lost();
                        tracing::warn!(key = token.key(), holder = %token.holder(), "Lease renewal refused, key no longer owned");
                    }
                    Err(e) => {
                        LockMetrics::record_store_error();
                        tracing::warn!(key = token.key(), error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    })
}
