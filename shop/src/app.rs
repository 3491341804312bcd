//! Service wiring.
//!
//! [`App::from_config`] picks a backend for each concern:
//!
//! | Concern | Configured | Fallback |
//! |---|---|---|
//! | Storage | [`PostgresStorage`] (`DATABASE_URL`) | [`InMemoryStorage`] |
//! | Locks | [`RedisCoordinationStore`] (`REDIS_URL`) | [`InMemoryCoordinationStore`] |
//! | Events | [`RedpandaEventBus`] (`REDPANDA_BROKERS`) | [`RecordingEventBus`] |
//!
//! The storage fallback is always available. The lock and event fallbacks
//! need the `in-process` feature; without it a missing `REDIS_URL` or
//! `REDPANDA_BROKERS` is a [`BootstrapError::NotConfigured`]. The fallbacks
//! make a single process self-contained; they do not coordinate across
//! instances.

use crate::catalog::{CartItem, Product};
use crate::config::Config;
use crate::coupon::CouponService;
use crate::order::OrderService;
use crate::storage::{InMemoryStorage, PostgresStorage, Storage, StoreError};
use crate::wallet::WalletService;
use std::sync::Arc;
use storefront_core::coordination::{CoordinationError, CoordinationStore};
use storefront_core::environment::{Clock, SystemClock};
use storefront_core::event_bus::{EventBus, EventBusError};
use storefront_redis::RedisCoordinationStore;
use storefront_redpanda::RedpandaEventBus;
use storefront_runtime::{LockExecutor, OptimisticRetry};
#[cfg(feature = "in-process")]
use storefront_testing::{InMemoryCoordinationStore, RecordingEventBus};
use thiserror::Error;

/// Errors raised while wiring the application.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Database connection or migration failed.
    #[error("Storage bootstrap failed: {0}")]
    Storage(#[from] StoreError),

    /// Redis could not be reached.
    #[error("Coordination store bootstrap failed: {0}")]
    Coordination(#[from] CoordinationError),

    /// The event producer could not be created.
    #[error("Event bus bootstrap failed: {0}")]
    EventBus(#[from] EventBusError),

    /// A backend has no configuration and in-process fallbacks are disabled.
    #[error("{0} is not set and the in-process feature is disabled")]
    NotConfigured(&'static str),
}

/// The storefront services sharing one storage, lock executor and clock.
#[derive(Clone)]
pub struct App {
    /// Coupon issuance and use
    pub coupons: CouponService,
    /// Point wallets
    pub wallets: WalletService,
    /// Checkout
    pub orders: OrderService,
    storage: Arc<dyn Storage>,
    locks: LockExecutor,
}

impl App {
    /// Connect every configured backend and build the services.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if a configured backend cannot be reached.
    pub async fn from_config(config: &Config) -> Result<Self, BootstrapError> {
        let storage: Arc<dyn Storage> = match &config.postgres.url {
            Some(url) => {
                let postgres = PostgresStorage::connect(url, config.postgres.max_connections).await?;
                postgres.migrate().await?;
                tracing::info!(max_connections = config.postgres.max_connections, "PostgreSQL storage ready");
                Arc::new(postgres)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory storage");
                Arc::new(InMemoryStorage::new())
            }
        };

        let coordination: Arc<dyn CoordinationStore> = match &config.redis.url {
            Some(url) => {
                let redis = RedisCoordinationStore::new(url).await?;
                tracing::info!("Redis coordination store ready");
                Arc::new(redis)
            }
            None => in_process_coordination()?,
        };

        let events: Arc<dyn EventBus> = match &config.redpanda.brokers {
            Some(brokers) => Arc::new(RedpandaEventBus::builder().brokers(brokers).build()?),
            None => in_process_events()?,
        };

        let locks = LockExecutor::new(coordination).with_defaults(config.lock_options());
        Ok(Self::assemble(
            storage,
            locks,
            OptimisticRetry::new(config.retry_policy()),
            events,
            config.redpanda.order_events_topic.clone(),
            Arc::new(SystemClock),
        ))
    }

    /// Build the services on top of ready backends.
    #[must_use]
    pub fn assemble(
        storage: Arc<dyn Storage>,
        locks: LockExecutor,
        retry: OptimisticRetry,
        events: Arc<dyn EventBus>,
        topic: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let coupons = CouponService::new(
            Arc::clone(&storage),
            locks.clone(),
            retry.clone(),
            Arc::clone(&clock),
        );
        let wallets = WalletService::new(
            Arc::clone(&storage),
            locks.clone(),
            retry,
            Arc::clone(&clock),
        );
        let orders = OrderService::new(
            Arc::clone(&storage),
            locks.clone(),
            coupons.clone(),
            wallets.clone(),
            events,
            topic,
            clock,
        );

        Self {
            coupons,
            wallets,
            orders,
            storage,
            locks,
        }
    }

    /// Shared lock executor.
    #[must_use]
    pub const fn locks(&self) -> &LockExecutor {
        &self.locks
    }

    /// Add a product to the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn add_product(&self, product: Product) -> Result<Product, StoreError> {
        let mut uow = self.storage.begin().await?;
        let product = uow.insert_product(&product).await?;
        uow.commit().await?;
        Ok(product)
    }

    /// Put a line into a user's cart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn add_to_cart(&self, item: CartItem) -> Result<CartItem, StoreError> {
        let mut uow = self.storage.begin().await?;
        let item = uow.insert_cart_item(&item).await?;
        uow.commit().await?;
        Ok(item)
    }
}

#[cfg(feature = "in-process")]
#[allow(clippy::unnecessary_wraps)]
fn in_process_coordination() -> Result<Arc<dyn CoordinationStore>, BootstrapError> {
    tracing::warn!("REDIS_URL not set, locks are process-local");
    Ok(Arc::new(InMemoryCoordinationStore::new()))
}

#[cfg(not(feature = "in-process"))]
fn in_process_coordination() -> Result<Arc<dyn CoordinationStore>, BootstrapError> {
    Err(BootstrapError::NotConfigured("REDIS_URL"))
}

#[cfg(feature = "in-process")]
#[allow(clippy::unnecessary_wraps)]
fn in_process_events() -> Result<Arc<dyn EventBus>, BootstrapError> {
    tracing::warn!("REDPANDA_BROKERS not set, order events are only recorded");
    Ok(Arc::new(RecordingEventBus::new()))
}

#[cfg(not(feature = "in-process"))]
fn in_process_events() -> Result<Arc<dyn EventBus>, BootstrapError> {
    Err(BootstrapError::NotConfigured("REDPANDA_BROKERS"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[cfg(feature = "in-process")]
    #[tokio::test]
    async fn in_process_backends_when_nothing_is_configured() {
        use crate::types::{Money, UserId};

        let app = App::from_config(&Config::default()).await.unwrap();

        let product = app.add_product(Product::new("Mug", Money::new(1_200), 3)).await.unwrap();
        let line = app
            .add_to_cart(CartItem::new(UserId::new(1), product.id, 2))
            .await
            .unwrap();

        assert!(product.id.get() > 0);
        assert_eq!(line.product_id, product.id);
        assert_eq!(app.wallets.balance(UserId::new(1)).await.unwrap(), Money::ZERO);
    }

    #[cfg(not(feature = "in-process"))]
    #[tokio::test]
    async fn unconfigured_locks_fail_without_in_process_feature() {
        let err = App::from_config(&Config::default()).await.err().unwrap();

        assert!(matches!(err, BootstrapError::NotConfigured("REDIS_URL")));
    }
}
