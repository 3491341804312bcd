//! Storage contracts.
//!
//! Services work against a [`UnitOfWork`]: one transaction that exposes every
//! repository, commits atomically and rolls back when dropped uncommitted.
//! [`Storage::begin`] opens one.
//!
//! Version-checked saves take the *new* snapshot (version already bumped by
//! the aggregate) and succeed only while the stored row still has
//! `version - 1`; otherwise they return [`StoreError::VersionConflict`], which
//! [`OptimisticRetry`](storefront_runtime::OptimisticRetry) treats as retryable.
//!
//! Two implementations:
//!
//! - [`memory::InMemoryStorage`]: row locks plus staged writes applied on
//!   commit; used by tests and the single-process drill
//! - [`postgres::PostgresStorage`]: `sqlx` transactions, `SELECT ... FOR UPDATE`
//!   and `UPDATE ... WHERE version = $n`

use crate::catalog::{CartItem, Product};
use crate::coupon::{Coupon, CouponGrant};
use crate::order::{Order, OutboxEvent};
use crate::types::{CartItemId, CouponId, GrantId, OrderId, ProductId, UserId};
use crate::wallet::{Wallet, WalletTransaction};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use storefront_runtime::ConflictAware;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;

/// Errors raised by storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The row changed since it was read.
    #[error("Version conflict on {entity} {id}")]
    VersionConflict {
        /// Entity kind (`coupon`, `grant`, `wallet`, ...)
        entity: &'static str,
        /// Row id
        id: i64,
    },

    /// A uniqueness constraint rejected the write.
    #[error("Unique constraint '{constraint}' violated")]
    UniqueViolation {
        /// Constraint name
        constraint: String,
    },

    /// Row referenced by a write does not exist.
    #[error("{entity} {id} not found")]
    RowNotFound {
        /// Entity kind
        entity: &'static str,
        /// Row id
        id: i64,
    },

    /// Database or driver failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl ConflictAware for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Boxed future returned by storage methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Coupon definitions.
pub trait CouponRepository: Send {
    /// Read a coupon and hold its row lock until the unit of work ends.
    fn find_coupon_for_update(&mut self, id: CouponId) -> StoreFuture<'_, Option<Coupon>>;

    /// Read a coupon without locking.
    fn find_coupon(&mut self, id: CouponId) -> StoreFuture<'_, Option<Coupon>>;

    /// Insert a new coupon; returns it with its assigned id.
    fn insert_coupon(&mut self, coupon: &Coupon) -> StoreFuture<'_, Coupon>;

    /// Version-checked update.
    fn save_coupon(&mut self, coupon: &Coupon) -> StoreFuture<'_, Coupon>;

    /// Every coupon, by id.
    fn find_all_coupons(&mut self) -> StoreFuture<'_, Vec<Coupon>>;

    /// Coupons issuable at `now`, by id.
    fn find_issuable_coupons(&mut self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<Coupon>>;
}

/// Issued coupons.
pub trait GrantRepository: Send {
    /// The grant of `coupon` held by `user`.
    fn find_grant_by_user_and_coupon(
        &mut self,
        user: UserId,
        coupon: CouponId,
    ) -> StoreFuture<'_, Option<CouponGrant>>;

    /// Grant by id.
    fn find_grant(&mut self, id: GrantId) -> StoreFuture<'_, Option<CouponGrant>>;

    /// Every grant held by `user`, by id.
    fn find_grants_by_user(&mut self, user: UserId) -> StoreFuture<'_, Vec<CouponGrant>>;

    /// Insert a grant. Fails with [`StoreError::UniqueViolation`] if the user
    /// already holds the coupon.
    fn insert_grant(&mut self, grant: &CouponGrant) -> StoreFuture<'_, CouponGrant>;

    /// Version-checked update.
    fn save_grant(&mut self, grant: &CouponGrant) -> StoreFuture<'_, CouponGrant>;

    /// Remove a grant.
    fn delete_grant(&mut self, id: GrantId) -> StoreFuture<'_, ()>;
}

/// Wallets and their ledger.
pub trait WalletRepository: Send {
    /// Wallet owned by `user`.
    fn find_wallet(&mut self, user: UserId) -> StoreFuture<'_, Option<Wallet>>;

    /// Insert a wallet. Fails with [`StoreError::UniqueViolation`] if the user
    /// already has one.
    fn insert_wallet(&mut self, wallet: &Wallet) -> StoreFuture<'_, Wallet>;

    /// Version-checked update.
    fn save_wallet(&mut self, wallet: &Wallet) -> StoreFuture<'_, Wallet>;

    /// Append a ledger entry.
    fn append_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> StoreFuture<'_, WalletTransaction>;

    /// Ledger of `user`, oldest first.
    fn wallet_transactions(&mut self, user: UserId) -> StoreFuture<'_, Vec<WalletTransaction>>;
}

/// Products and carts.
pub trait CatalogRepository: Send {
    /// Cart lines by id; missing ids are skipped.
    fn cart_items(&mut self, ids: &[CartItemId]) -> StoreFuture<'_, Vec<CartItem>>;

    /// Products by id; missing ids are skipped.
    fn products(&mut self, ids: &[ProductId]) -> StoreFuture<'_, Vec<Product>>;

    /// Take `quantity` units if at least that many are in stock.
    fn decrement_stock(&mut self, product: ProductId, quantity: u32) -> StoreFuture<'_, bool>;

    /// Remove `user`'s cart lines in `ids`.
    fn remove_cart_items(&mut self, user: UserId, ids: &[CartItemId]) -> StoreFuture<'_, ()>;

    /// Insert a product; returns it with its assigned id.
    fn insert_product(&mut self, product: &Product) -> StoreFuture<'_, Product>;

    /// Insert a cart line; returns it with its assigned id.
    fn insert_cart_item(&mut self, item: &CartItem) -> StoreFuture<'_, CartItem>;
}

/// Orders and the order outbox.
pub trait OrderRepository: Send {
    /// Insert an order with its items; returns it with its assigned id.
    fn insert_order(&mut self, order: &Order) -> StoreFuture<'_, Order>;

    /// Overwrite an order's status and timestamps.
    fn save_order(&mut self, order: &Order) -> StoreFuture<'_, Order>;

    /// Order by id, with items.
    fn find_order(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>>;

    /// Orders of `user`, newest first.
    fn find_orders_by_user(&mut self, user: UserId) -> StoreFuture<'_, Vec<Order>>;

    /// Append an outbox row.
    fn append_outbox(&mut self, event: &OutboxEvent) -> StoreFuture<'_, OutboxEvent>;

    /// Up to `limit` unpublished outbox rows, oldest first.
    fn pending_outbox(&mut self, limit: usize) -> StoreFuture<'_, Vec<OutboxEvent>>;

    /// Flag an outbox row as relayed.
    fn mark_outbox_published(&mut self, id: i64) -> StoreFuture<'_, ()>;
}

/// One storage transaction.
///
/// Dropping it without [`commit`](UnitOfWork::commit) discards every write.
pub trait UnitOfWork:
    CouponRepository + GrantRepository + WalletRepository + CatalogRepository + OrderRepository
{
    /// Make every write of this unit visible atomically.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// Opens units of work.
pub trait Storage: Send + Sync {
    /// Start a transaction.
    fn begin(&self) -> StoreFuture<'_, Box<dyn UnitOfWork>>;
}
