//! Coupons: definitions with a hard quantity cap, per-user grants and the
//! first-come-first-served issuance workflow.

mod error;
mod grant;
mod model;
mod service;

pub use error::CouponError;
pub use grant::CouponGrant;
pub use model::{Coupon, CouponStatus, NewCoupon};
pub use service::{CouponService, GrantWithCoupon};
