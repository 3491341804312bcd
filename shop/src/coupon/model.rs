//! Coupon definition aggregate.

use super::CouponError;
use crate::types::{CouponId, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a coupon definition.
///
/// ```text
/// Active ──(available hits 0)──▶ SoldOut ──(increase_quantity)──▶ Active
///   │                               │
///   └──────────(disable)────────────┴──────▶ Disabled
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CouponStatus {
    /// Open for issuance
    Active,
    /// No units left
    SoldOut,
    /// Withdrawn by an administrator; terminal
    Disabled,
}

impl CouponStatus {
    /// Stable name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::SoldOut => "SOLD_OUT",
            Self::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CouponStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "SOLD_OUT" => Ok(Self::SoldOut),
            "DISABLED" => Ok(Self::Disabled),
            other => Err(format!("unknown coupon status '{other}'")),
        }
    }
}

/// Input for [`Coupon::create`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewCoupon {
    /// Display name
    pub name: String,
    /// Fixed discount per order
    pub discount: Money,
    /// Units that may ever be issued
    pub total_quantity: u32,
    /// Start of the validity window
    pub starts_at: DateTime<Utc>,
    /// End of the validity window (inclusive)
    pub ends_at: DateTime<Utc>,
}

/// A coupon definition with a hard issuance cap.
///
/// Every mutation returns a new snapshot with `version + 1`; storage accepts
/// the snapshot only if the stored version is still the one it was built from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    /// Storage id
    pub id: CouponId,
    /// Display name
    pub name: String,
    /// Fixed discount per order
    pub discount: Money,
    /// Units that may ever be issued
    pub total_quantity: u32,
    /// Units still available
    pub available_quantity: u32,
    /// Lifecycle state
    pub status: CouponStatus,
    /// Start of the validity window
    pub starts_at: DateTime<Utc>,
    /// End of the validity window (inclusive)
    pub ends_at: DateTime<Utc>,
    /// Optimistic version
    pub version: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    /// Validate `new` and build an `Active` coupon with every unit available.
    ///
    /// # Errors
    ///
    /// [`CouponError::InvalidQuantity`] for a blank name, a non-positive
    /// discount or a zero quantity; [`CouponError::InvalidDateRange`] if the
    /// window ends before it starts.
    pub fn create(new: NewCoupon, now: DateTime<Utc>) -> Result<Self, CouponError> {
        if new.name.trim().is_empty() {
            return Err(CouponError::InvalidQuantity("name is required".to_string()));
        }
        if !new.discount.is_positive() {
            return Err(CouponError::InvalidQuantity(
                "discount must be greater than zero".to_string(),
            ));
        }
        if new.total_quantity == 0 {
            return Err(CouponError::InvalidQuantity(
                "total quantity must be greater than zero".to_string(),
            ));
        }
        if new.ends_at < new.starts_at {
            return Err(CouponError::InvalidDateRange);
        }

        Ok(Self {
            id: CouponId::UNASSIGNED,
            name: new.name,
            discount: new.discount,
            total_quantity: new.total_quantity,
            available_quantity: new.total_quantity,
            status: CouponStatus::Active,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Check that one more unit may be issued at `now`.
    ///
    /// Checked in order: disabled, outside the window, sold out.
    ///
    /// # Errors
    ///
    /// [`CouponError::NotActive`], [`CouponError::Expired`] or
    /// [`CouponError::SoldOut`].
    pub fn validate_issuable(&self, now: DateTime<Utc>) -> Result<(), CouponError> {
        if self.status == CouponStatus::Disabled {
            return Err(CouponError::NotActive(self.id));
        }
        if !self.is_within_window(now) {
            return Err(CouponError::Expired(self.id));
        }
        if self.available_quantity == 0 || self.status == CouponStatus::SoldOut {
            return Err(CouponError::SoldOut(self.id));
        }
        Ok(())
    }

    /// True if [`validate_issuable`](Self::validate_issuable) would pass.
    #[must_use]
    pub fn is_issuable(&self, now: DateTime<Utc>) -> bool {
        self.validate_issuable(now).is_ok()
    }

    /// True if `now` lies in `[starts_at, ends_at]`.
    #[must_use]
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && now <= self.ends_at
    }

    /// Take one unit.
    ///
    /// # Errors
    ///
    /// [`CouponError::SoldOut`] when nothing is left; never clamps.
    pub fn decrease_quantity(&self, now: DateTime<Utc>) -> Result<Self, CouponError> {
        if self.available_quantity == 0 {
            return Err(CouponError::SoldOut(self.id));
        }
        let mut next = self.next(now);
        next.available_quantity -= 1;
        if next.available_quantity == 0 && next.status == CouponStatus::Active {
            next.status = CouponStatus::SoldOut;
        }
        Ok(next)
    }

    /// Give one unit back (compensation for a cancelled issuance).
    ///
    /// # Errors
    ///
    /// [`CouponError::InvalidQuantity`] if every unit is already available.
    pub fn increase_quantity(&self, now: DateTime<Utc>) -> Result<Self, CouponError> {
        if self.available_quantity >= self.total_quantity {
            return Err(CouponError::InvalidQuantity(
                "nothing to restore".to_string(),
            ));
        }
        let mut next = self.next(now);
        next.available_quantity += 1;
        if next.status == CouponStatus::SoldOut {
            next.status = CouponStatus::Active;
        }
        Ok(next)
    }

    /// Withdraw the coupon for good.
    #[must_use]
    pub fn disable(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.next(now);
        next.status = CouponStatus::Disabled;
        next
    }

    fn next(&self, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn new_coupon(total: u32) -> NewCoupon {
        NewCoupon {
            name: "Summer sale".to_string(),
            discount: Money::new(1_000),
            total_quantity: total,
            starts_at: now() - Duration::days(1),
            ends_at: now() + Duration::days(1),
        }
    }

    #[test]
    fn create_validates_inputs() {
        let mut blank = new_coupon(1);
        blank.name = "  ".to_string();
        assert!(matches!(Coupon::create(blank, now()), Err(CouponError::InvalidQuantity(_))));

        let mut free = new_coupon(1);
        free.discount = Money::ZERO;
        assert!(matches!(Coupon::create(free, now()), Err(CouponError::InvalidQuantity(_))));

        assert!(matches!(
            Coupon::create(new_coupon(0), now()),
            Err(CouponError::InvalidQuantity(_))
        ));

        let mut backwards = new_coupon(1);
        backwards.ends_at = backwards.starts_at - Duration::seconds(1);
        assert!(matches!(
            Coupon::create(backwards, now()),
            Err(CouponError::InvalidDateRange)
        ));
    }

    #[test]
    fn last_unit_flips_to_sold_out_and_bumps_version() {
        let coupon = Coupon::create(new_coupon(2), now()).unwrap();

        let one_left = coupon.decrease_quantity(now()).unwrap();
        assert_eq!(one_left.available_quantity, 1);
        assert_eq!(one_left.status, CouponStatus::Active);
        assert_eq!(one_left.version, 1);

        let empty = one_left.decrease_quantity(now()).unwrap();
        assert_eq!(empty.available_quantity, 0);
        assert_eq!(empty.status, CouponStatus::SoldOut);
        assert_eq!(empty.version, 2);

        assert!(matches!(empty.decrease_quantity(now()), Err(CouponError::SoldOut(_))));
        assert_eq!(coupon.available_quantity, 2, "snapshots are immutable");
    }

    #[test]
    fn restoring_a_unit_reactivates() {
        let sold_out = Coupon::create(new_coupon(1), now())
            .unwrap()
            .decrease_quantity(now())
            .unwrap();

        let restored = sold_out.increase_quantity(now()).unwrap();
        assert_eq!(restored.status, CouponStatus::Active);
        assert_eq!(restored.available_quantity, 1);
        assert!(matches!(
            restored.increase_quantity(now()),
            Err(CouponError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn issuable_checks_run_in_order() {
        let coupon = Coupon::create(new_coupon(1), now()).unwrap();
        let sold_out = coupon.decrease_quantity(now()).unwrap();
        let disabled = sold_out.disable(now());
        let late = now() + Duration::days(2);

        assert!(coupon.validate_issuable(now()).is_ok());
        assert!(matches!(sold_out.validate_issuable(now()), Err(CouponError::SoldOut(_))));
        assert!(matches!(sold_out.validate_issuable(late), Err(CouponError::Expired(_))));
        assert!(matches!(disabled.validate_issuable(late), Err(CouponError::NotActive(_))));
    }

    #[test]
    fn window_is_inclusive() {
        let coupon = Coupon::create(new_coupon(1), now()).unwrap();
        assert!(coupon.is_within_window(coupon.starts_at));
        assert!(coupon.is_within_window(coupon.ends_at));
        assert!(!coupon.is_within_window(coupon.ends_at + Duration::milliseconds(1)));
    }

    #[test]
    fn status_round_trips_through_storage_name() {
        for status in [CouponStatus::Active, CouponStatus::SoldOut, CouponStatus::Disabled] {
            assert_eq!(status.as_str().parse::<CouponStatus>().unwrap(), status);
        }
        assert!("EXPIRED".parse::<CouponStatus>().is_err());
    }
}
