//! # Storefront Testing
//!
//! Test doubles for the storefront backend.
//!
//! - [`InMemoryCoordinationStore`]: re-entrant leased locks without Redis
//! - [`RecordingEventBus`]: captures published events, can be set to fail
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//! - [`init_test_tracing`]: route `tracing` output through the test harness
//!
//! ## Example
//!
//! ```ignore
//! use storefront_testing::{InMemoryCoordinationStore, test_clock};
//! use storefront_runtime::LockExecutor;
//!
//! #[tokio::test]
//! async fn issue_under_contention() {
//!     let locks = LockExecutor::new(Arc::new(InMemoryCoordinationStore::new()));
//!     let clock = Arc::new(test_clock());
//!     // build services on top of locks and clock...
//! }
//! ```

use chrono::{DateTime, Utc};
use storefront_core::environment::Clock;

pub mod coordination;
pub mod event_bus;

/// Mock implementations of Environment traits
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use storefront_testing::mocks::FixedClock;
    /// use storefront_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that tests move by hand.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the service under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Jump to `time`.
        #[allow(clippy::missing_panics_doc)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }

        /// Move forward by `delta`.
        #[allow(clippy::missing_panics_doc)]
        pub fn advance(&self, delta: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += delta;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub use coordination::InMemoryCoordinationStore;
pub use event_bus::RecordingEventBus;
pub use mocks::{FixedClock, ManualClock, test_clock};
