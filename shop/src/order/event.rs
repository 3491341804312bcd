//! Order completion event published after checkout commits.

use super::{Order, OrderStatus};
use crate::types::{Money, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storefront_core::event::Event;

/// Published after an order is paid for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    /// Order concerned
    pub order_id: OrderId,
    /// Human-facing order number
    pub order_number: String,
    /// Buyer
    pub user_id: UserId,
    /// Amount charged to the wallet
    pub final_amount: Money,
    /// Order status at publication
    pub status: OrderStatus,
    /// When the order reached `status`
    pub completed_at: DateTime<Utc>,
}

impl OrderCompleted {
    /// Event for `order`.
    #[must_use]
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            final_amount: order.final_amount,
            status: order.status,
            completed_at: order.updated_at,
        }
    }
}

impl Event for OrderCompleted {
    fn event_type(&self) -> &'static str {
        "OrderCompleted.v1"
    }
}
