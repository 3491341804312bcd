//! Identifiers and money.
//!
//! Every cross-aggregate reference is one of the id newtypes below, resolved
//! through storage. Ids are assigned by storage on insert; a freshly built
//! aggregate carries the `UNASSIGNED` id until then.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl $name {
            /// Placeholder carried until storage assigns a real id.
            pub const UNASSIGNED: Self = Self(0);

            /// Wrap a raw id.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Raw id as stored.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }

            /// Id used in lock keys.
            ///
            /// Positive ids keep their value. The mapping is one-to-one, so a
            /// negative id never shares a key with its absolute value.
            #[must_use]
            pub const fn lock_id(self) -> u64 {
                u64::from_be_bytes(self.0.to_be_bytes())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Identifies a user (owner of a wallet, grants, cart and orders).
    UserId
);
id_type!(
    /// Identifies a coupon definition.
    CouponId
);
id_type!(
    /// Identifies one user's issued coupon.
    GrantId
);
id_type!(
    /// Identifies a product.
    ProductId
);
id_type!(
    /// Identifies a cart line.
    CartItemId
);
id_type!(
    /// Identifies an order.
    OrderId
);
id_type!(
    /// Identifies a wallet.
    WalletId
);

/// Amount in the store's smallest currency unit (points).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw amount.
    #[must_use]
    pub const fn new(amount: i64) -> Self {
        Self(amount)
    }

    /// Raw amount.
    #[must_use]
    pub const fn amount(self) -> i64 {
        self.0
    }

    /// True if strictly greater than zero.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `self * quantity`, saturating.
    #[must_use]
    pub fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(i64::from(quantity)))
    }

    /// `self - other`, never below zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        let diff = self.0.saturating_sub(other.0);
        if diff < 0 { Self::ZERO } else { Self(diff) }
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_never_goes_negative_on_saturating_sub() {
        assert_eq!(Money::new(5).saturating_sub(Money::new(8)), Money::ZERO);
        assert_eq!(Money::new(8).saturating_sub(Money::new(5)), Money::new(3));
    }

    #[test]
    fn line_totals_sum() {
        let total: Money = [Money::new(1_000).times(2), Money::new(500).times(3)]
            .into_iter()
            .sum();
        assert_eq!(total, Money::new(3_500));
    }

    #[test]
    fn ids_map_to_lock_ids() {
        assert_eq!(ProductId::new(100).lock_id(), 100);
        assert_ne!(ProductId::new(-100).lock_id(), ProductId::new(100).lock_id());
        assert_ne!(UserId::new(-1).lock_id(), UserId::new(1).lock_id());
        assert_eq!(UserId::UNASSIGNED.get(), 0);
        assert_eq!(GrantId::from(9).to_string(), "9");
    }
}
