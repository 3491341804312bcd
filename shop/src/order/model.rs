//! Order aggregate, line items and outbox rows.

use crate::types::{GrantId, Money, OrderId, ProductId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Persisted, resources not yet taken
    Pending,
    /// Stock, points and coupon taken
    Paid,
    /// Fulfilled
    Completed,
    /// Cancelled
    Canceled,
}

impl OrderStatus {
    /// Stable name used in storage and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
        }
    }

    /// True if moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid | Self::Canceled)
                | (Self::Paid, Self::Completed | Self::Canceled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// One product line with price and name captured at order time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Product bought
    pub product_id: ProductId,
    /// Product name at order time
    pub product_name: String,
    /// Unit price at order time
    pub unit_price: Money,
    /// Units bought
    pub quantity: u32,
}

impl OrderItem {
    /// `unit_price * quantity`.
    #[must_use]
    pub fn subtotal(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// A placed order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Storage id
    pub id: OrderId,
    /// Human-facing order number
    pub order_number: String,
    /// Buyer
    pub user_id: UserId,
    /// Sum of line subtotals
    pub total_amount: Money,
    /// Coupon discount, never above the total
    pub discount_amount: Money,
    /// `total_amount - discount_amount`
    pub final_amount: Money,
    /// Lifecycle state
    pub status: OrderStatus,
    /// Grant spent on this order
    pub coupon_grant_id: Option<GrantId>,
    /// Product lines
    pub items: Vec<OrderItem>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a `Pending` order from its lines.
    ///
    /// The discount is capped at the total, so the final amount is never
    /// negative.
    #[must_use]
    pub fn pending(
        user_id: UserId,
        order_number: String,
        items: Vec<OrderItem>,
        discount: Money,
        coupon_grant_id: Option<GrantId>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_amount: Money = items.iter().map(OrderItem::subtotal).sum();
        let discount_amount = discount.min(total_amount);
        Self {
            id: OrderId::UNASSIGNED,
            order_number,
            user_id,
            total_amount,
            discount_amount,
            final_amount: total_amount.saturating_sub(discount_amount),
            status: OrderStatus::Pending,
            coupon_grant_id,
            items,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same order in `status`, if the transition is allowed.
    #[must_use]
    pub fn with_status(&self, status: OrderStatus, now: DateTime<Utc>) -> Option<Self> {
        self.status.can_transition_to(status).then(|| Self {
            status,
            updated_at: now,
            ..self.clone()
        })
    }
}

/// Pending notification about an order, written with the order itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Storage id
    pub id: i64,
    /// Order concerned
    pub order_id: OrderId,
    /// Order status at the time of writing
    pub order_status: OrderStatus,
    /// When the row was written
    pub created_at: DateTime<Utc>,
    /// Relayed to the event bus
    pub published: bool,
}

impl OutboxEvent {
    /// Unpublished entry for `order`.
    #[must_use]
    pub const fn for_order(order: &Order) -> Self {
        Self {
            id: 0,
            order_id: order.id,
            order_status: order.status,
            created_at: order.updated_at,
            published: false,
        }
    }
}
