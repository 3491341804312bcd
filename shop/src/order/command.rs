//! Checkout command.

use super::OrderError;
use crate::types::{CartItemId, CouponId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Checkout request: which cart lines to buy and an optional coupon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderCommand {
    /// Cart lines to check out
    pub cart_item_ids: Vec<CartItemId>,
    /// Coupon to apply
    pub coupon_id: Option<CouponId>,
}

impl CreateOrderCommand {
    /// Build a command.
    #[must_use]
    pub const fn new(cart_item_ids: Vec<CartItemId>, coupon_id: Option<CouponId>) -> Self {
        Self {
            cart_item_ids,
            coupon_id,
        }
    }

    /// Reject a checkout without cart lines.
    ///
    /// # Errors
    ///
    /// [`OrderError::EmptyCart`] if `cart_item_ids` is empty.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.cart_item_ids.is_empty() {
            return Err(OrderError::EmptyCart);
        }
        Ok(())
    }

    /// Cart line ids without repeats, ascending.
    #[must_use]
    pub fn distinct_cart_items(&self) -> Vec<CartItemId> {
        self.cart_item_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cart_is_rejected() {
        let command = CreateOrderCommand::new(vec![], None);
        assert!(matches!(command.validate(), Err(OrderError::EmptyCart)));
    }

    #[test]
    fn repeated_cart_lines_collapse() {
        let command = CreateOrderCommand::new(
            vec![CartItemId::new(3), CartItemId::new(1), CartItemId::new(3)],
            None,
        );
        assert!(command.validate().is_ok());
        assert_eq!(
            command.distinct_cart_items(),
            vec![CartItemId::new(1), CartItemId::new(3)]
        );
    }
}
