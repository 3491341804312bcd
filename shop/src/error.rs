//! Error classification for a consuming API layer.
//!
//! Every service error maps onto one [`ErrorClass`], which an HTTP or RPC
//! front end can turn into a status code without matching on each variant.
//!
//! ```
//! use shop::coupon::CouponError;
//! use shop::error::{Classify, ErrorClass};
//! use shop::types::CouponId;
//!
//! let err = CouponError::SoldOut(CouponId::new(1));
//! assert_eq!(err.class(), ErrorClass::ClientError);
//! assert_eq!(err.class().code(), "CLIENT_ERROR");
//! ```

use crate::coupon::CouponError;
use crate::order::OrderError;
use crate::storage::StoreError;
use crate::wallet::WalletError;
use serde::{Deserialize, Serialize};
use std::fmt;
use storefront_runtime::LockError;

/// Coarse outcome category of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Lost a race for a one-time resource (issued twice, used twice).
    Conflict,
    /// The request can never succeed as sent.
    ClientError,
    /// A referenced entity does not exist.
    NotFound,
    /// Contention or a transient outage; the caller may retry.
    Unavailable,
    /// Storage or infrastructure failure.
    Internal,
}

impl ErrorClass {
    /// True when retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Conflict => "CONFLICT",
            Self::ClientError => "CLIENT_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Matching HTTP status code.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Conflict => 409,
            Self::ClientError => 422,
            Self::NotFound => 404,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors that know their [`ErrorClass`].
pub trait Classify {
    /// Category of this error.
    fn class(&self) -> ErrorClass;
}

impl Classify for LockError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Unavailable
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            // Only surfaces once optimistic retries are exhausted.
            Self::VersionConflict { .. } => ErrorClass::Unavailable,
            Self::UniqueViolation { .. } => ErrorClass::Conflict,
            Self::RowNotFound { .. } => ErrorClass::NotFound,
            Self::Database(_) => ErrorClass::Internal,
        }
    }
}

impl Classify for CouponError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::GrantNotFound(_) => ErrorClass::NotFound,
            Self::AlreadyIssued { .. } | Self::AlreadyUsed(_) => ErrorClass::Conflict,
            Self::NotActive(_)
            | Self::Expired(_)
            | Self::SoldOut(_)
            | Self::GrantExpired(_)
            | Self::InvalidQuantity(_)
            | Self::InvalidDateRange => ErrorClass::ClientError,
            Self::Lock(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }
}

impl Classify for WalletError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::InvalidAmount(_) | Self::InsufficientBalance { .. } => ErrorClass::ClientError,
            Self::Lock(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }
}

impl Classify for OrderError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::WalletNotFound(_)
            | Self::CartItemNotFound(_)
            | Self::ProductNotFound(_)
            | Self::NotFound(_) => ErrorClass::NotFound,
            Self::EmptyCart
            | Self::CartItemNotOwned { .. }
            | Self::InsufficientStock { .. }
            | Self::CouponInvalid(_)
            | Self::InsufficientBalance { .. }
            | Self::InvalidStatusTransition { .. } => ErrorClass::ClientError,
            Self::Coupon(e) => e.class(),
            Self::Wallet(e) => e.class(),
            Self::Lock(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }
}
