//! Order error type.

use super::OrderStatus;
use crate::coupon::CouponError;
use crate::storage::StoreError;
use crate::types::{CartItemId, CouponId, Money, OrderId, ProductId, UserId};
use crate::wallet::WalletError;
use storefront_runtime::{ConflictAware, LockError};
use thiserror::Error;

/// Errors from order operations.
#[derive(Error, Debug)]
pub enum OrderError {
    /// The command names no cart lines.
    #[error("Order has no cart items")]
    EmptyCart,

    /// The buyer has no wallet to pay from.
    #[error("Wallet for user {0} not found")]
    WalletNotFound(UserId),

    /// A cart line does not exist.
    #[error("Cart item {0} not found")]
    CartItemNotFound(CartItemId),

    /// A cart line belongs to another user.
    #[error("Cart item {item} does not belong to user {user}")]
    CartItemNotOwned {
        /// Cart line
        item: CartItemId,
        /// Buyer
        user: UserId,
    },

    /// A cart line points at a missing product.
    #[error("Product {0} not found")]
    ProductNotFound(ProductId),

    /// Not enough units left.
    #[error("Insufficient stock for product {product}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product
        product: ProductId,
        /// Units in the order
        requested: u32,
        /// Units in stock
        available: u32,
    },

    /// The user holds no usable grant of the coupon.
    #[error("Coupon {0} cannot be used for this order")]
    CouponInvalid(CouponId),

    /// The wallet does not cover the final amount.
    #[error("Insufficient balance for user {user}: required {required}, available {available}")]
    InsufficientBalance {
        /// Buyer
        user: UserId,
        /// Final amount
        required: Money,
        /// Wallet balance
        available: Money,
    },

    /// No such order.
    #[error("Order {0} not found")]
    NotFound(OrderId),

    /// The requested status change is not allowed.
    #[error("Order cannot move from {from} to {to}")]
    InvalidStatusTransition {
        /// Current status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// Coupon step failed.
    #[error(transparent)]
    Coupon(#[from] CouponError),

    /// Wallet step failed.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// The order's locks could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConflictAware for OrderError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Coupon(e) => e.is_conflict(),
            Self::Wallet(e) => e.is_conflict(),
            Self::Store(e) => e.is_conflict(),
            _ => false,
        }
    }
}
