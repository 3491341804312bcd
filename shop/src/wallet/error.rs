//! Wallet error type.

use crate::storage::StoreError;
use crate::types::{Money, UserId};
use storefront_runtime::{ConflictAware, LockError};
use thiserror::Error;

/// Errors from wallet operations.
#[derive(Error, Debug)]
pub enum WalletError {
    /// The user has never charged points.
    #[error("Wallet for user {0} not found")]
    NotFound(UserId),

    /// Amount must be greater than zero.
    #[error("Invalid amount: {0}")]
    InvalidAmount(Money),

    /// Balance does not cover the amount.
    #[error("Insufficient balance for user {user}: required {required}, available {available}")]
    InsufficientBalance {
        /// Wallet owner
        user: UserId,
        /// Amount requested
        required: Money,
        /// Current balance
        available: Money,
    },

    /// The wallet's lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConflictAware for WalletError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
