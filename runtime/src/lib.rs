//! # Storefront Runtime
//!
//! Concurrency-control executors for the storefront backend.
//!
//! ## Components
//!
//! - **[`LockExecutor`]**: acquires a sorted set of distributed locks with one
//!   shared deadline, supports same-call-chain re-entrance, renews leases while
//!   the action runs and releases everything in reverse order on every exit
//! - **[`OptimisticRetry`]**: replays a version-checked read-modify-write when
//!   it loses a race, up to a bounded number of attempts
//! - **[`metrics`]**: Prometheus exporter and metric recorders
//!
//! ## Example
//!
//! ```ignore
//! use storefront_runtime::{LockExecutor, OptimisticRetry};
//!
//! let executor = LockExecutor::new(coordination_store);
//! let retry = OptimisticRetry::default();
//!
//! executor
//!     .run(&keys, || retry.run(|| debit_wallet(user, amount)))
//!     .await?;
//! ```

/// Distributed multi-key lock executor
pub mod lock_executor;

/// Prometheus metrics for observability
pub mod metrics;

/// Optimistic retry with exponential backoff
pub mod retry;

pub use lock_executor::{LockError, LockExecutor, LockOptions};
pub use retry::{ConflictAware, OptimisticRetry, RetryPolicy};
