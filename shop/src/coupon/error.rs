//! Coupon error type.

use crate::storage::StoreError;
use crate::types::{CouponId, GrantId, UserId};
use storefront_runtime::{ConflictAware, LockError};
use thiserror::Error;

/// Errors from coupon definitions, grants and the issuance workflow.
#[derive(Error, Debug)]
pub enum CouponError {
    /// No coupon with this id.
    #[error("Coupon {0} not found")]
    NotFound(CouponId),

    /// No issued coupon with this id.
    #[error("Issued coupon {0} not found")]
    GrantNotFound(GrantId),

    /// The coupon was disabled by an administrator.
    #[error("Coupon {0} is not active")]
    NotActive(CouponId),

    /// The current time is outside the coupon's validity window.
    #[error("Coupon {0} is outside its validity window")]
    Expired(CouponId),

    /// Every unit has been issued.
    #[error("Coupon {0} is sold out")]
    SoldOut(CouponId),

    /// The user already holds this coupon.
    #[error("Coupon {coupon} was already issued to user {user}")]
    AlreadyIssued {
        /// Requesting user
        user: UserId,
        /// Requested coupon
        coupon: CouponId,
    },

    /// The grant was already spent on an order.
    #[error("Issued coupon {0} was already used")]
    AlreadyUsed(GrantId),

    /// The grant's expiry has passed.
    #[error("Issued coupon {0} has expired")]
    GrantExpired(GrantId),

    /// Invalid name, amount or quantity.
    #[error("Invalid coupon quantity: {0}")]
    InvalidQuantity(String),

    /// The validity window ends before it starts.
    #[error("Coupon validity window ends before it starts")]
    InvalidDateRange,

    /// The coupon's lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CouponError {
    /// Short label used as a metrics dimension.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::GrantNotFound(_) => "not_found",
            Self::NotActive(_) => "not_active",
            Self::Expired(_) | Self::GrantExpired(_) => "expired",
            Self::SoldOut(_) => "sold_out",
            Self::AlreadyIssued { .. } => "already_issued",
            Self::AlreadyUsed(_) => "already_used",
            Self::InvalidQuantity(_) | Self::InvalidDateRange => "invalid",
            Self::Lock(_) => "lock",
            Self::Store(_) => "store",
        }
    }
}

impl ConflictAware for CouponError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
