//! # Storefront Core
//!
//! Shared vocabulary for the storefront concurrency-control backend.
//!
//! This crate holds the pure value types and the narrow contracts that the
//! rest of the workspace is written against:
//!
//! - **Lock keys**: [`lock::LockDomain`], [`lock::LockResource`] and the
//!   [`lock::LockRequestSet`] builder that turns a transaction's resources into
//!   a canonical, sorted key list
//! - **Coordination**: the [`coordination::CoordinationStore`] contract for
//!   re-entrant leased locks held in an external store
//! - **Events**: [`event::Event`], [`event::SerializedEvent`] and the
//!   publish-side [`event_bus::EventBus`]
//! - **Environment**: the [`environment::Clock`] abstraction
//!
//! ## Example
//!
//! ```
//! use storefront_core::lock::LockRequestSet;
//!
//! let keys = LockRequestSet::new()
//!     .with_wallet(7)
//!     .with_products([100, 20, 100])
//!     .with_coupon_grant(Some(55))
//!     .build_sorted_keys();
//!
//! assert_eq!(
//!     keys,
//!     vec![
//!         "lock:coupon:user:55",
//!         "lock:point:user:7",
//!         "lock:product:100",
//!         "lock:product:20",
//!     ]
//! );
//! ```

pub mod coordination;
pub mod event;
pub mod event_bus;
pub mod lock;

/// Environment traits for dependency injection
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Coupon validity windows, grant expiry and order timestamps all read the
    /// current time through this trait so tests can pin it.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
