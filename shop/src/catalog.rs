//! Products and cart lines.
//!
//! Pricing and stock bookkeeping live outside this crate; orders only need a
//! price snapshot, a stock level to compare against and a compare-and-decrement.

use crate::types::{CartItemId, Money, ProductId, UserId};
use serde::{Deserialize, Serialize};

/// A sellable product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Storage id
    pub id: ProductId,
    /// Display name
    pub name: String,
    /// Unit price
    pub price: Money,
    /// Units in stock
    pub stock: u32,
}

impl Product {
    /// Build a product ready for insertion.
    #[must_use]
    pub fn new(name: impl Into<String>, price: Money, stock: u32) -> Self {
        Self {
            id: ProductId::UNASSIGNED,
            name: name.into(),
            price,
            stock,
        }
    }
}

/// One line of a user's cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Storage id
    pub id: CartItemId,
    /// Cart owner
    pub user_id: UserId,
    /// Product in the line
    pub product_id: ProductId,
    /// Units requested
    pub quantity: u32,
}

impl CartItem {
    /// Build a cart line ready for insertion.
    #[must_use]
    pub const fn new(user_id: UserId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            id: CartItemId::UNASSIGNED,
            user_id,
            product_id,
            quantity,
        }
    }
}
