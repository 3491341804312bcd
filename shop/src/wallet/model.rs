//! Wallet aggregate and its transaction ledger.
//!
//! Every balance change produces a new [`Wallet`] snapshot plus one
//! [`WalletTransaction`] recording the amount and the balance after it.

use super::WalletError;
use crate::types::{Money, OrderId, UserId, WalletId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user's point balance.
///
/// Balance is never negative. Each mutation returns a new snapshot with
/// `version + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Storage id
    pub id: WalletId,
    /// Owner; one wallet per user
    pub user_id: UserId,
    /// Current balance
    pub balance: Money,
    /// Optimistic version
    pub version: i64,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Empty wallet for `user_id`.
    #[must_use]
    pub const fn open(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: WalletId::UNASSIGNED,
            user_id,
            balance: Money::ZERO,
            version: 0,
            updated_at: now,
        }
    }

    /// Add `amount`.
    ///
    /// # Errors
    ///
    /// [`WalletError::InvalidAmount`] unless `amount > 0`.
    pub fn charge(&self, amount: Money, now: DateTime<Utc>) -> Result<Self, WalletError> {
        Self::require_positive(amount)?;
        Ok(self.next(self.balance + amount, now))
    }

    /// Spend `amount`.
    ///
    /// # Errors
    ///
    /// [`WalletError::InvalidAmount`] unless `amount > 0`;
    /// [`WalletError::InsufficientBalance`] if the balance does not cover it.
    pub fn use_points(&self, amount: Money, now: DateTime<Utc>) -> Result<Self, WalletError> {
        Self::require_positive(amount)?;
        if amount > self.balance {
            return Err(WalletError::InsufficientBalance {
                user: self.user_id,
                required: amount,
                available: self.balance,
            });
        }
        Ok(self.next(self.balance - amount, now))
    }

    /// Give back `amount`.
    ///
    /// # Errors
    ///
    /// [`WalletError::InvalidAmount`] unless `amount > 0`.
    pub fn refund(&self, amount: Money, now: DateTime<Utc>) -> Result<Self, WalletError> {
        Self::require_positive(amount)?;
        Ok(self.next(self.balance + amount, now))
    }

    const fn require_positive(amount: Money) -> Result<(), WalletError> {
        if amount.is_positive() {
            Ok(())
        } else {
            Err(WalletError::InvalidAmount(amount))
        }
    }

    const fn next(&self, balance: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            user_id: self.user_id,
            balance,
            version: self.version + 1,
            updated_at: now,
        }
    }
}

/// Kind of balance movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Points added
    Charge,
    /// Points spent on an order
    Use,
    /// Points returned
    Refund,
}

impl TransactionKind {
    /// Stable name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Charge => "CHARGE",
            Self::Use => "USE",
            Self::Refund => "REFUND",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHARGE" => Ok(Self::Charge),
            "USE" => Ok(Self::Use),
            "REFUND" => Ok(Self::Refund),
            other => Err(format!("unknown wallet transaction kind '{other}'")),
        }
    }
}

/// Ledger entry appended with every wallet mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// Storage id
    pub id: i64,
    /// Wallet owner
    pub user_id: UserId,
    /// Movement kind
    pub kind: TransactionKind,
    /// Amount moved (always positive)
    pub amount: Money,
    /// Balance after the movement
    pub balance_after: Money,
    /// Order that caused it, if any
    pub order_id: Option<OrderId>,
    /// When it happened
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// Entry recording the move that produced `wallet`.
    #[must_use]
    pub const fn record(
        wallet: &Wallet,
        kind: TransactionKind,
        amount: Money,
        order_id: Option<OrderId>,
    ) -> Self {
        Self {
            id: 0,
            user_id: wallet.user_id,
            kind,
            amount,
            balance_after: wallet.balance,
            order_id,
            created_at: wallet.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn charge_use_refund_adjust_balance_and_version() {
        let now = Utc::now();
        let wallet = Wallet::open(UserId::new(1), now);

        let charged = wallet.charge(Money::new(10_000), now).unwrap();
        let spent = charged.use_points(Money::new(3_000), now).unwrap();
        let refunded = spent.refund(Money::new(500), now).unwrap();

        assert_eq!(refunded.balance, Money::new(7_500));
        assert_eq!(refunded.version, 3);
    }

    #[test]
    fn overspending_is_rejected() {
        let now = Utc::now();
        let wallet = Wallet::open(UserId::new(1), now)
            .charge(Money::new(100), now)
            .unwrap();

        assert!(matches!(
            wallet.use_points(Money::new(101), now),
            Err(WalletError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let wallet = Wallet::open(UserId::new(1), Utc::now());
        for amount in [Money::ZERO, Money::new(-5)] {
            assert!(matches!(
                wallet.charge(amount, Utc::now()),
                Err(WalletError::InvalidAmount(_))
            ));
        }
    }
}
