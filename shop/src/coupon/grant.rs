//! A user's issued coupon.

use super::{Coupon, CouponError};
use crate::types::{CouponId, GrantId, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One issued unit of a coupon, owned by one user.
///
/// `(user_id, coupon_id)` is unique across all grants. Using a grant binds it
/// to an order and cannot be undone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponGrant {
    /// Storage id
    pub id: GrantId,
    /// Owner
    pub user_id: UserId,
    /// Coupon definition
    pub coupon_id: CouponId,
    /// Issuance time
    pub issued_at: DateTime<Utc>,
    /// Copied from the coupon's `ends_at` at issuance
    pub expires_at: DateTime<Utc>,
    /// Spent on an order
    pub used: bool,
    /// Order the grant was spent on
    pub order_id: Option<OrderId>,
    /// When it was spent
    pub used_at: Option<DateTime<Utc>>,
    /// Optimistic version
    pub version: i64,
}

impl CouponGrant {
    /// Issue `coupon` to `user` at `now`.
    #[must_use]
    pub const fn issue(user_id: UserId, coupon: &Coupon, now: DateTime<Utc>) -> Self {
        Self {
            id: GrantId::UNASSIGNED,
            user_id,
            coupon_id: coupon.id,
            issued_at: now,
            expires_at: coupon.ends_at,
            used: false,
            order_id: None,
            used_at: None,
            version: 0,
        }
    }

    /// True if the grant has passed its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// True if the grant can still be spent at `now`.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired(now)
    }

    /// Spend the grant on `order_id`.
    ///
    /// # Errors
    ///
    /// [`CouponError::AlreadyUsed`] if already spent, [`CouponError::GrantExpired`]
    /// if past its expiry.
    pub fn use_for(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Self, CouponError> {
        if self.used {
            return Err(CouponError::AlreadyUsed(self.id));
        }
        if self.is_expired(now) {
            return Err(CouponError::GrantExpired(self.id));
        }
        Ok(Self {
            used: true,
            order_id: Some(order_id),
            used_at: Some(now),
            version: self.version + 1,
            ..self.clone()
        })
    }
}
