//! Optimistic retry with exponential backoff.
//!
//! Rows guarded by a version column are updated with a compare-and-set: the
//! write succeeds only if the version read earlier is still current. When it
//! is not, the whole read-modify-write must be replayed against fresh state.
//! [`OptimisticRetry`] does that replay, up to a bounded number of attempts,
//! and lets every other error through untouched.
//!
//! # Example
//!
//! ```rust
//! use storefront_runtime::retry::{ConflictAware, OptimisticRetry, RetryPolicy};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Stale;
//!
//! impl std::fmt::Display for Stale {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("stale version")
//!     }
//! }
//!
//! impl ConflictAware for Stale {
//!     fn is_conflict(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), Stale> {
//! let retry = OptimisticRetry::new(
//!     RetryPolicy::builder()
//!         .max_attempts(3)
//!         .initial_delay(Duration::from_millis(5))
//!         .build(),
//! );
//!
//! let balance = retry.run(|| async { Ok::<_, Stale>(1_000) }).await?;
//! assert_eq!(balance, 1_000);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Errors that can report an optimistic version conflict.
pub trait ConflictAware {
    /// True when the failure was a stale-version write that may succeed if
    /// the operation is replayed.
    fn is_conflict(&self) -> bool;
}

/// Backoff policy between optimistic attempts.
///
/// # Default Values
///
/// - `max_attempts`: 5 (total attempts, including the first)
/// - `initial_delay`: 10ms
/// - `max_delay`: 100ms
/// - `multiplier`: 2.0
/// - `jitter`: enabled (delay scaled by a random factor in `0.5..=1.0`)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap for exponential backoff
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Randomize delays to spread out colliding writers
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: None,
        }
    }

    /// Policy that replays immediately, without sleeping.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::ZERO)
            .max_delay(Duration::ZERO)
            .jitter(false)
            .build()
    }

    /// Calculate delay after the failed attempt `attempt` (0-indexed).
    ///
    /// `delay = min(initial_delay * multiplier^attempt, max_delay)`, scaled by
    /// jitter when enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        #[allow(clippy::cast_possible_wrap)]
        let base_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(30) as i32);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter && capped_secs > 0.0 {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };

        Duration::from_secs_f64(capped_secs * factor)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts (minimum 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set delay before the second attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(5).max(1),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(10)),
            max_delay: self.max_delay.unwrap_or(Duration::from_millis(100)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter.unwrap_or(true),
        }
    }
}

/// Replays an operation while it fails with a version conflict.
///
/// Holds no lock and keeps no state between calls; one instance can be shared
/// by every service.
#[derive(Debug, Clone, Default)]
pub struct OptimisticRetry {
    policy: RetryPolicy,
}

impl OptimisticRetry {
    /// Create an executor with `policy`.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The backoff policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, replaying it on conflict.
    ///
    /// Each attempt should open its own unit of work so it reads fresh state.
    ///
    /// # Errors
    ///
    /// Returns the first non-conflict error unchanged, or the last conflict
    /// once `max_attempts` attempts have failed.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ConflictAware + Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(self.succeeded(attempt, value)),
                Err(err) => {
                    if let Some(err) = self.after_failure(attempt, err).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Run `operation` against a caller-owned state, replaying it on conflict.
    ///
    /// Used when the retried step is part of a larger unit of work: every
    /// attempt gets the same `state` back and re-reads the row through it.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_in<S, T, E, F>(&self, state: &mut S, mut operation: F) -> Result<T, E>
    where
        S: ?Sized + Send,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, E>>,
        E: ConflictAware + Display,
    {
        let mut attempt = 0;
        loop {
            match operation(&mut *state).await {
                Ok(value) => return Ok(self.succeeded(attempt, value)),
                Err(err) => {
                    if let Some(err) = self.after_failure(attempt, err).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn succeeded<T>(&self, attempt: u32, value: T) -> T {
        if attempt > 0 {
            RetryMetrics::record_success();
            tracing::debug!(
                attempt,
                max_attempts = self.policy.max_attempts,
                "Optimistic write succeeded after retry"
            );
        }
        value
    }

    /// Decide what to do with a failed attempt. `Some(err)` ends the loop.
    async fn after_failure<E>(&self, attempt: u32, err: E) -> Option<E>
    where
        E: ConflictAware + Display,
    {
        if !err.is_conflict() {
            tracing::debug!(error = %err, "Error is not a version conflict, failing immediately");
            return Some(err);
        }

        RetryMetrics::record_conflict();

        if attempt + 1 >= self.policy.max_attempts {
            RetryMetrics::record_exhausted();
            tracing::error!(
                attempts = attempt + 1,
                error = %err,
                "Optimistic write failed after max attempts"
            );
            return Some(err);
        }

        let delay = self.policy.delay_for_attempt(attempt);
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis(),
            error = %err,
            "Version conflict, retrying"
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
        None
    }
}
