//! Coupon issuance and use.
//!
//! Issuance serializes on `lock:coupon:issue:{coupon}` and re-reads the coupon
//! row with an exclusive lock inside the unit of work, so at most
//! `total_quantity` grants exist and no user holds two of the same coupon even
//! if the distributed lock is lost. Use serializes on
//! `lock:coupon:user:{grant}` and replays on version conflicts.

use super::{Coupon, CouponError, CouponGrant, NewCoupon};
use crate::storage::{Storage, StoreError, UnitOfWork};
use crate::types::{CouponId, GrantId, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::lock::LockRequestSet;
use storefront_runtime::metrics::ShopMetrics;
use storefront_runtime::{LockExecutor, OptimisticRetry};

/// A user's grant together with its coupon definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantWithCoupon {
    /// The issued grant
    pub grant: CouponGrant,
    /// Its coupon definition
    pub coupon: Coupon,
}

/// Coupon workflows.
#[derive(Clone)]
pub struct CouponService {
    storage: Arc<dyn Storage>,
    locks: LockExecutor,
    retry: OptimisticRetry,
    clock: Arc<dyn Clock>,
}

impl CouponService {
    /// Create a service.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        locks: LockExecutor,
        retry: OptimisticRetry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            locks,
            retry,
            clock,
        }
    }

    /// Register a new coupon definition.
    ///
    /// # Errors
    ///
    /// [`CouponError::InvalidQuantity`] or [`CouponError::InvalidDateRange`]
    /// for bad input; [`CouponError::Store`] on storage failure.
    pub async fn create_coupon(&self, new: NewCoupon) -> Result<Coupon, CouponError> {
        let coupon = Coupon::create(new, self.clock.now())?;
        let mut uow = self.storage.begin().await?;
        let coupon = uow.insert_coupon(&coupon).await?;
        uow.commit().await?;

        tracing::info!(
            coupon_id = %coupon.id,
            name = %coupon.name,
            total_quantity = coupon.total_quantity,
            "Coupon created"
        );
        Ok(coupon)
    }

    /// Issue one unit of `coupon_id` to `user`.
    ///
    /// # Errors
    ///
    /// - [`CouponError::NotFound`] if the coupon does not exist
    /// - [`CouponError::NotActive`], [`CouponError::Expired`] or
    ///   [`CouponError::SoldOut`] if it cannot be issued now
    /// - [`CouponError::AlreadyIssued`] if the user already holds it
    /// - [`CouponError::Lock`] if the issuance lock stayed busy
    pub async fn issue_coupon(
        &self,
        user: UserId,
        coupon_id: CouponId,
    ) -> Result<CouponGrant, CouponError> {
        let keys = LockRequestSet::new()
            .with_coupon_issue(coupon_id.lock_id())
            .build_sorted_keys();

        let result = self
            .locks
            .run(&keys, move || async move { self.issue_locked(user, coupon_id).await })
            .await;

        match &result {
            Ok(grant) => {
                ShopMetrics::record_coupon_issued();
                tracing::info!(
                    user_id = %user,
                    coupon_id = %coupon_id,
                    grant_id = %grant.id,
                    "Coupon issued"
                );
            }
            Err(e) => {
                ShopMetrics::record_coupon_rejected(e.reason());
                tracing::debug!(user_id = %user, coupon_id = %coupon_id, error = %e, "Coupon issuance rejected");
            }
        }
        result
    }

    async fn issue_locked(
        &self,
        user: UserId,
        coupon_id: CouponId,
    ) -> Result<CouponGrant, CouponError> {
        let now = self.clock.now();
        let mut uow = self.storage.begin().await?;

        let coupon = uow
            .find_coupon_for_update(coupon_id)
            .await?
            .ok_or(CouponError::NotFound(coupon_id))?;
        coupon.validate_issuable(now)?;

        if uow
            .find_grant_by_user_and_coupon(user, coupon_id)
            .await?
            .is_some()
        {
            return Err(CouponError::AlreadyIssued {
                user,
                coupon: coupon_id,
            });
        }

        let coupon = uow.save_coupon(&coupon.decrease_quantity(now)?).await?;
        let grant = match uow.insert_grant(&CouponGrant::issue(user, &coupon, now)).await {
            Ok(grant) => grant,
            Err(StoreError::UniqueViolation { .. }) => {
                return Err(CouponError::AlreadyIssued {
                    user,
                    coupon: coupon_id,
                });
            }
            Err(e) => return Err(e.into()),
        };

        uow.commit().await?;
        Ok(grant)
    }

    /// Spend `grant_id` on `order_id` in a unit of work of its own.
    ///
    /// # Errors
    ///
    /// [`CouponError::GrantNotFound`], [`CouponError::AlreadyUsed`] or
    /// [`CouponError::GrantExpired`]; [`CouponError::Store`] once version
    /// conflicts exhaust the retry policy.
    pub async fn use_coupon(
        &self,
        grant_id: GrantId,
        order_id: OrderId,
    ) -> Result<CouponGrant, CouponError> {
        let keys = grant_keys(grant_id);
        self.locks
            .run(&keys, move || async move {
                self.retry
                    .run(move || async move {
                        let now = self.clock.now();
                        let mut uow = self.storage.begin().await?;
                        let grant = mark_used(uow.as_mut(), grant_id, order_id, now).await?;
                        uow.commit().await?;
                        Ok(grant)
                    })
                    .await
            })
            .await
    }

    /// Spend `grant_id` on `order_id` inside the caller's unit of work.
    ///
    /// Re-enters the grant lock when the caller already holds it.
    ///
    /// # Errors
    ///
    /// Same as [`use_coupon`](Self::use_coupon).
    pub async fn use_coupon_in(
        &self,
        uow: &mut dyn UnitOfWork,
        grant_id: GrantId,
        order_id: OrderId,
    ) -> Result<CouponGrant, CouponError> {
        let keys = grant_keys(grant_id);
        let now = self.clock.now();
        let grant = self
            .locks
            .run(&keys, move || async move {
                self.retry
                    .run_in(uow, move |uow| {
                        Box::pin(mark_used(uow, grant_id, order_id, now))
                    })
                    .await
            })
            .await?;

        tracing::debug!(grant_id = %grant_id, order_id = %order_id, "Coupon grant used");
        Ok(grant)
    }

    /// Stop issuing `coupon_id`. Grants already issued stay usable.
    ///
    /// # Errors
    ///
    /// [`CouponError::NotFound`] if the coupon does not exist.
    pub async fn disable_coupon(&self, coupon_id: CouponId) -> Result<Coupon, CouponError> {
        let keys = LockRequestSet::new()
            .with_coupon_issue(coupon_id.lock_id())
            .build_sorted_keys();

        let coupon = self
            .locks
            .run(&keys, move || async move {
                self.retry
                    .run(move || async move {
                        let now = self.clock.now();
                        let mut uow = self.storage.begin().await?;
                        let coupon = uow
                            .find_coupon(coupon_id)
                            .await?
                            .ok_or(CouponError::NotFound(coupon_id))?;
                        let coupon = uow.save_coupon(&coupon.disable(now)).await?;
                        uow.commit().await?;
                        Ok::<_, CouponError>(coupon)
                    })
                    .await
            })
            .await?;

        tracing::info!(coupon_id = %coupon_id, "Coupon disabled");
        Ok(coupon)
    }

    /// Take back an unused grant and return its unit to the coupon.
    ///
    /// # Errors
    ///
    /// [`CouponError::GrantNotFound`] if the grant does not exist,
    /// [`CouponError::AlreadyUsed`] if it was spent.
    pub async fn cancel_issuance(&self, grant_id: GrantId) -> Result<Coupon, CouponError> {
        let grant = {
            let mut uow = self.storage.begin().await?;
            uow.find_grant(grant_id)
                .await?
                .ok_or(CouponError::GrantNotFound(grant_id))?
        };
        let keys = LockRequestSet::new()
            .with_coupon_issue(grant.coupon_id.lock_id())
            .with_coupon_grant(Some(grant_id.lock_id()))
            .build_sorted_keys();

        let coupon = self
            .locks
            .run(&keys, move || async move {
                let now = self.clock.now();
                let mut uow = self.storage.begin().await?;
                let grant = uow
                    .find_grant(grant_id)
                    .await?
                    .ok_or(CouponError::GrantNotFound(grant_id))?;
                if grant.used {
                    return Err(CouponError::AlreadyUsed(grant_id));
                }

                let coupon = uow
                    .find_coupon_for_update(grant.coupon_id)
                    .await?
                    .ok_or(CouponError::NotFound(grant.coupon_id))?;
                let coupon = uow.save_coupon(&coupon.increase_quantity(now)?).await?;
                uow.delete_grant(grant_id).await?;
                uow.commit().await?;
                Ok(coupon)
            })
            .await?;

        tracing::info!(
            grant_id = %grant_id,
            coupon_id = %coupon.id,
            available_quantity = coupon.available_quantity,
            "Coupon issuance cancelled"
        );
        Ok(coupon)
    }

    /// Coupons that can be issued right now.
    ///
    /// # Errors
    ///
    /// [`CouponError::Store`] on storage failure.
    pub async fn list_issuable(&self) -> Result<Vec<Coupon>, CouponError> {
        let mut uow = self.storage.begin().await?;
        Ok(uow.find_issuable_coupons(self.clock.now()).await?)
    }

    /// Every coupon definition.
    ///
    /// # Errors
    ///
    /// [`CouponError::Store`] on storage failure.
    pub async fn list_all(&self) -> Result<Vec<Coupon>, CouponError> {
        let mut uow = self.storage.begin().await?;
        Ok(uow.find_all_coupons().await?)
    }

    /// One coupon definition.
    ///
    /// # Errors
    ///
    /// [`CouponError::NotFound`] if it does not exist.
    pub async fn get_coupon(&self, coupon_id: CouponId) -> Result<Coupon, CouponError> {
        let mut uow = self.storage.begin().await?;
        uow.find_coupon(coupon_id)
            .await?
            .ok_or(CouponError::NotFound(coupon_id))
    }

    /// Grants held by `user` with their coupons; used grants only when
    /// `include_used`.
    ///
    /// # Errors
    ///
    /// [`CouponError::Store`] on storage failure.
    pub async fn my_coupons(
        &self,
        user: UserId,
        include_used: bool,
    ) -> Result<Vec<GrantWithCoupon>, CouponError> {
        let mut uow = self.storage.begin().await?;
        let grants = uow.find_grants_by_user(user).await?;

        let mut owned = Vec::with_capacity(grants.len());
        for grant in grants.into_iter().filter(|g| include_used || !g.used) {
            let coupon = uow
                .find_coupon(grant.coupon_id)
                .await?
                .ok_or(CouponError::NotFound(grant.coupon_id))?;
            owned.push(GrantWithCoupon { grant, coupon });
        }
        Ok(owned)
    }

    /// The grant of `coupon_id` held by `user`, if it can still be spent.
    ///
    /// # Errors
    ///
    /// [`CouponError::Store`] on storage failure.
    pub async fn find_usable_grant(
        &self,
        user: UserId,
        coupon_id: CouponId,
    ) -> Result<Option<CouponGrant>, CouponError> {
        let now = self.clock.now();
        let mut uow = self.storage.begin().await?;
        let grant = uow.find_grant_by_user_and_coupon(user, coupon_id).await?;
        Ok(grant.filter(|g| g.is_usable(now)))
    }
}

fn grant_keys(grant_id: GrantId) -> Vec<String> {
    LockRequestSet::new()
        .with_coupon_grant(Some(grant_id.lock_id()))
        .build_sorted_keys()
}

async fn mark_used<U: UnitOfWork + ?Sized>(
    uow: &mut U,
    grant_id: GrantId,
    order_id: OrderId,
    now: DateTime<Utc>,
) -> Result<CouponGrant, CouponError> {
    let grant = uow
        .find_grant(grant_id)
        .await?
        .ok_or(CouponError::GrantNotFound(grant_id))?;
    let used = grant.use_for(order_id, now)?;
    Ok(uow.save_grant(&used).await?)
}
