//! Shared fixture for the storefront integration suites.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use chrono::Duration as ChronoDuration;
use shop::App;
use shop::catalog::{CartItem, Product};
use shop::coupon::{Coupon, NewCoupon};
use shop::storage::InMemoryStorage;
use shop::types::{CartItemId, Money, UserId};
use std::sync::Arc;
use std::time::Duration;
use storefront_core::environment::Clock;
use storefront_runtime::{LockExecutor, LockOptions, OptimisticRetry};
use storefront_testing::{InMemoryCoordinationStore, RecordingEventBus, init_test_tracing, test_clock};

pub const TOPIC: &str = "order-completed";

/// Services over in-process backends, with handles to inspect them.
pub struct Shop {
    pub app: App,
    pub storage: InMemoryStorage,
    pub coordination: InMemoryCoordinationStore,
    pub events: RecordingEventBus,
    pub clock: Arc<dyn Clock>,
}

pub fn shop() -> Shop {
    init_test_tracing();
    let storage = InMemoryStorage::new();
    let coordination = InMemoryCoordinationStore::with_spin_interval(Duration::from_millis(1));
    let events = RecordingEventBus::new();
    let clock: Arc<dyn Clock> = Arc::new(test_clock());

    let locks = LockExecutor::new(Arc::new(coordination.clone())).with_defaults(
        LockOptions::default().with_wait_time(Duration::from_secs(30)),
    );
    let app = App::assemble(
        Arc::new(storage.clone()),
        locks,
        OptimisticRetry::default(),
        Arc::new(events.clone()),
        TOPIC,
        Arc::clone(&clock),
    );

    Shop {
        app,
        storage,
        coordination,
        events,
        clock,
    }
}

impl Shop {
    /// An active coupon whose window contains the test clock.
    pub async fn coupon(&self, total_quantity: u32, discount: i64) -> Coupon {
        let now = self.clock.now();
        self.app
            .coupons
            .create_coupon(NewCoupon {
                name: "Welcome".to_string(),
                discount: Money::new(discount),
                total_quantity,
                starts_at: now - ChronoDuration::days(1),
                ends_at: now + ChronoDuration::days(30),
            })
            .await
            .unwrap()
    }

    pub async fn product(&self, price: i64, stock: u32) -> Product {
        self.app
            .add_product(Product::new("Keyboard", Money::new(price), stock))
            .await
            .unwrap()
    }

    pub async fn cart_line(&self, user: UserId, product: &Product, quantity: u32) -> CartItemId {
        self.app
            .add_to_cart(CartItem::new(user, product.id, quantity))
            .await
            .unwrap()
            .id
    }

    pub async fn funded(&self, user: UserId, amount: i64) {
        self.app.wallets.charge(user, Money::new(amount)).await.unwrap();
    }
}
