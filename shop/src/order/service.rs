//! Checkout across several contended resources.
//!
//! An order touches the buyer's wallet, the stock of every product in the cart
//! and optionally one coupon grant. All of their lock keys are taken up front,
//! sorted, so two overlapping checkouts always contend in the same order and
//! cannot deadlock. The wallet debit and the grant use re-enter the locks they
//! need from inside the checkout.
//!
//! ```text
//! resolve products + grant ──► lock {wallet, products.., grant} ──► unit of work
//!                                                                     │ stock
//!                                                                     │ wallet  (re-entrant)
//!                                                                     │ coupon  (re-entrant)
//!                                                                     │ outbox
//!                                                                     ▼ commit
//!                                              publish OrderCompleted (best effort)
//! ```

use super::{
    CreateOrderCommand, Order, OrderCompleted, OrderError, OrderItem, OrderStatus, OutboxEvent,
};
use crate::catalog::Product;
use crate::coupon::{CouponError, CouponGrant, CouponService};
use crate::storage::Storage;
use crate::types::{CartItemId, CouponId, Money, OrderId, ProductId, UserId};
use crate::wallet::WalletService;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::event::SerializedEvent;
use storefront_core::event_bus::EventBus;
use storefront_core::lock::LockRequestSet;
use storefront_runtime::LockExecutor;
use storefront_runtime::metrics::ShopMetrics;
use uuid::Uuid;

/// Order workflows.
#[derive(Clone)]
pub struct OrderService {
    storage: Arc<dyn Storage>,
    locks: LockExecutor,
    coupons: CouponService,
    wallets: WalletService,
    events: Arc<dyn EventBus>,
    topic: String,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    /// Create a service publishing completions to `topic`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        locks: LockExecutor,
        coupons: CouponService,
        wallets: WalletService,
        events: Arc<dyn EventBus>,
        topic: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            locks,
            coupons,
            wallets,
            events,
            topic: topic.into(),
            clock,
        }
    }

    /// Check out `command.cart_item_ids` for `user`.
    ///
    /// Either the order is paid for (stock taken, wallet debited, grant spent,
    /// cart lines removed) or nothing changes.
    ///
    /// # Errors
    ///
    /// - [`OrderError::EmptyCart`], [`OrderError::WalletNotFound`],
    ///   [`OrderError::CartItemNotFound`], [`OrderError::CouponInvalid`] before
    ///   any lock is taken
    /// - [`OrderError::CartItemNotOwned`], [`OrderError::InsufficientStock`],
    ///   [`OrderError::InsufficientBalance`] or a wrapped coupon/wallet error
    ///   from inside the checkout
    /// - [`OrderError::Lock`] if a resource stayed busy past the wait time
    pub async fn create_order(
        &self,
        user: UserId,
        command: CreateOrderCommand,
    ) -> Result<Order, OrderError> {
        command.validate()?;
        let cart_ids = command.distinct_cart_items();
        let (product_ids, grant) = self.resolve(user, &cart_ids, command.coupon_id).await?;

        let keys = LockRequestSet::new()
            .with_wallet(user.lock_id())
            .with_products(product_ids.iter().map(|id| id.lock_id()))
            .with_coupon_grant(grant.as_ref().map(|g| g.id.lock_id()))
            .build_sorted_keys();
        tracing::debug!(user_id = %user, keys = ?keys, "Order lock keys built");

        let (order, outbox) = self
            .locks
            .run(&keys, move || self.place(user, cart_ids, grant))
            .await?;

        ShopMetrics::record_order_created();
        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            user_id = %user,
            final_amount = %order.final_amount,
            "Order created"
        );

        self.publish(&order, &outbox).await;
        Ok(order)
    }

    /// Products in the cart and the grant to spend, read before locking.
    async fn resolve(
        &self,
        user: UserId,
        cart_ids: &[CartItemId],
        coupon_id: Option<CouponId>,
    ) -> Result<(Vec<ProductId>, Option<CouponGrant>), OrderError> {
        let product_ids = {
            let mut uow = self.storage.begin().await?;
            if uow.find_wallet(user).await?.is_none() {
                return Err(OrderError::WalletNotFound(user));
            }
            let items = uow.cart_items(cart_ids).await?;
            if let Some(missing) = cart_ids
                .iter()
                .find(|id| !items.iter().any(|item| item.id == **id))
            {
                return Err(OrderError::CartItemNotFound(*missing));
            }
            items
                .iter()
                .map(|item| item.product_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        let grant = match coupon_id {
            Some(coupon_id) => Some(
                self.coupons
                    .find_usable_grant(user, coupon_id)
                    .await?
                    .ok_or(OrderError::CouponInvalid(coupon_id))?,
            ),
            None => None,
        };
        Ok((product_ids, grant))
    }

    /// The checkout body; runs with every key held.
    async fn place(
        &self,
        user: UserId,
        cart_ids: Vec<CartItemId>,
        grant: Option<CouponGrant>,
    ) -> Result<(Order, OutboxEvent), OrderError> {
        let now = self.clock.now();
        let mut uow = self.storage.begin().await?;

        let cart = uow.cart_items(&cart_ids).await?;
        for id in &cart_ids {
            match cart.iter().find(|item| item.id == *id) {
                None => return Err(OrderError::CartItemNotFound(*id)),
                Some(item) if item.user_id != user => {
                    return Err(OrderError::CartItemNotOwned { item: *id, user });
                }
                Some(_) => {}
            }
        }

        let mut wanted: BTreeMap<ProductId, u32> = BTreeMap::new();
        for item in &cart {
            let units = wanted.entry(item.product_id).or_default();
            *units = units.saturating_add(item.quantity);
        }
        let product_ids: Vec<ProductId> = wanted.keys().copied().collect();
        let catalog: BTreeMap<ProductId, Product> = uow
            .products(&product_ids)
            .await?
            .into_iter()
            .map(|product| (product.id, product))
            .collect();

        for (product_id, requested) in &wanted {
            let product = catalog
                .get(product_id)
                .ok_or(OrderError::ProductNotFound(*product_id))?;
            if product.stock < *requested {
                return Err(OrderError::InsufficientStock {
                    product: *product_id,
                    requested: *requested,
                    available: product.stock,
                });
            }
        }

        let mut lines = Vec::with_capacity(cart.len());
        for item in &cart {
            let product = catalog
                .get(&item.product_id)
                .ok_or(OrderError::ProductNotFound(item.product_id))?;
            lines.push(OrderItem {
                product_id: product.id,
                product_name: product.name.clone(),
                unit_price: product.price,
                quantity: item.quantity,
            });
        }

        let discount = match &grant {
            Some(grant) => {
                uow.find_coupon(grant.coupon_id)
                    .await?
                    .ok_or(CouponError::NotFound(grant.coupon_id))?
                    .discount
            }
            None => Money::ZERO,
        };

        let wallet = uow
            .find_wallet(user)
            .await?
            .ok_or(OrderError::WalletNotFound(user))?;
        let order = Order::pending(
            user,
            order_number(now),
            lines,
            discount,
            grant.as_ref().map(|g| g.id),
            now,
        );
        if order.final_amount > wallet.balance {
            return Err(OrderError::InsufficientBalance {
                user,
                required: order.final_amount,
                available: wallet.balance,
            });
        }

        let order = uow.insert_order(&order).await?;

        for (product_id, requested) in &wanted {
            if !uow.decrement_stock(*product_id, *requested).await? {
                return Err(OrderError::InsufficientStock {
                    product: *product_id,
                    requested: *requested,
                    available: catalog.get(product_id).map_or(0, |p| p.stock),
                });
            }
        }

        if order.final_amount.is_positive() {
            self.wallets
                .use_points_in(uow.as_mut(), user, order.final_amount, order.id)
                .await?;
        }
        if let Some(grant) = &grant {
            self.coupons
                .use_coupon_in(uow.as_mut(), grant.id, order.id)
                .await?;
        }

        let paid = order
            .with_status(OrderStatus::Paid, now)
            .ok_or(OrderError::InvalidStatusTransition {
                from: order.status,
                to: OrderStatus::Paid,
            })?;
        let paid = uow.save_order(&paid).await?;
        uow.remove_cart_items(user, &cart_ids).await?;
        let outbox = uow.append_outbox(&OutboxEvent::for_order(&paid)).await?;

        uow.commit().await?;
        Ok((paid, outbox))
    }

    /// Hand the completion of `order` to the event bus.
    ///
    /// Failures are logged and the outbox row stays pending. Returns whether
    /// the event went out.
    async fn publish(&self, order: &Order, outbox: &OutboxEvent) -> bool {
        let metadata = serde_json::json!({
            "partition_key": order.id.to_string(),
            "order_id": order.id.get(),
            "outbox_id": outbox.id,
        });
        let event = match SerializedEvent::from_event(&OrderCompleted::from_order(order), Some(metadata)) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Failed to serialize order event");
                return false;
            }
        };

        if let Err(e) = self.events.publish(&self.topic, &event).await {
            ShopMetrics::record_event_publish_error();
            tracing::warn!(
                order_id = %order.id,
                topic = %self.topic,
                error = %e,
                "Order event not published, left in outbox"
            );
            return false;
        }
        ShopMetrics::record_event_published();

        if let Err(e) = self.mark_published(outbox.id).await {
            tracing::warn!(outbox_id = outbox.id, error = %e, "Failed to mark outbox row published");
        }
        true
    }

    async fn mark_published(&self, outbox_id: i64) -> Result<(), OrderError> {
        let mut uow = self.storage.begin().await?;
        uow.mark_outbox_published(outbox_id).await?;
        uow.commit().await?;
        Ok(())
    }

    /// Publish up to `limit` outbox rows left behind by failed publishes.
    ///
    /// Returns how many went out.
    ///
    /// # Errors
    ///
    /// [`OrderError::Store`] on storage failure.
    pub async fn relay_pending(&self, limit: usize) -> Result<usize, OrderError> {
        let pending = {
            let mut uow = self.storage.begin().await?;
            let pending = uow.pending_outbox(limit).await?;
            let mut orders = Vec::with_capacity(pending.len());
            for entry in pending {
                match uow.find_order(entry.order_id).await? {
                    Some(order) => orders.push((order, entry)),
                    None => tracing::warn!(outbox_id = entry.id, order_id = %entry.order_id, "Outbox row without order"),
                }
            }
            orders
        };

        let mut relayed = 0;
        for (order, entry) in &pending {
            if self.publish(order, entry).await {
                relayed += 1;
            }
        }
        if relayed > 0 {
            tracing::info!(relayed, pending = pending.len(), "Outbox relayed");
        }
        Ok(relayed)
    }

    /// One order with its items.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`] if it does not exist.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let mut uow = self.storage.begin().await?;
        uow.find_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Orders of `user`, newest first.
    ///
    /// # Errors
    ///
    /// [`OrderError::Store`] on storage failure.
    pub async fn orders_for_user(&self, user: UserId) -> Result<Vec<Order>, OrderError> {
        let mut uow = self.storage.begin().await?;
        Ok(uow.find_orders_by_user(user).await?)
    }

    /// Move an order to `status`.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`], or [`OrderError::InvalidStatusTransition`]
    /// for a backward or skipped transition.
    pub async fn update_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<Order, OrderError> {
        let now = self.clock.now();
        let mut uow = self.storage.begin().await?;
        let order = uow
            .find_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        let next = order
            .with_status(status, now)
            .ok_or(OrderError::InvalidStatusTransition {
                from: order.status,
                to: status,
            })?;
        let saved = uow.save_order(&next).await?;
        uow.commit().await?;

        tracing::info!(order_id = %order_id, from = %order.status, to = %status, "Order status updated");
        Ok(saved)
    }
}

/// `ORDER-{yyyyMMddHHmmss}-{8 hex chars}`.
fn order_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "ORDER-{}-{}",
        now.format("%Y%m%d%H%M%S"),
        suffix.get(..8).unwrap_or(&suffix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_carry_timestamp_and_unique_suffix() {
        let now = DateTime::parse_from_rfc3339("2025-03-04T05:06:07Z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        let first = order_number(now);
        let second = order_number(now);

        assert!(first.starts_with("ORDER-20250304050607-"));
        assert_eq!(first.len(), "ORDER-20250304050607-".len() + 8);
        assert_ne!(first, second);
    }
}
