//! Storefront services - coupon issuance, point wallets and checkout under contention
//!
//! Every workflow here mutates a resource that many requests race for: a
//! limited coupon, a user's point balance, a product's stock. The crate
//! combines two concurrency controls from `storefront-runtime`:
//!
//! - **Distributed locks**: each workflow names the resources it touches with
//!   a [`LockRequestSet`](storefront_core::lock::LockRequestSet) and runs under
//!   the sorted key set, re-entering keys it already holds
//! - **Optimistic versions**: every row carries a version; a stale write is
//!   retried from a fresh read
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  ┌───────────────┐  ┌───────────────┐
//! │ CouponService │  │ WalletService │◄─┤ OrderService  │
//! └───────┬───────┘  └───────┬───────┘  └──┬─────┬──────┘
//!         ▲                  │             │     │
//!         └──────────────────┼─────────────┘     ▼
//!                            │               EventBus
//!         ┌──────────────────┴───────┐      (Redpanda)
//!         ▼                          ▼
//!   LockExecutor               Storage / UnitOfWork
//!   (Redis)                    (PostgreSQL)
//! ```
//!
//! # Key Features
//!
//! ## 1. First-Come-First-Served Coupons
//!
//! ```text
//! lock:coupon:issue:{coupon}
//!   SELECT ... FOR UPDATE → validate → already issued? → quantity - 1 → insert grant
//! ```
//!
//! At most `total` grants are issued and at most one per user; the unique
//! `(user_id, coupon_id)` constraint backs the existence check.
//!
//! ## 2. All-or-Nothing Checkout
//!
//! An order locks the wallet, every product and the coupon grant, then takes
//! stock, debits points and spends the grant in one unit of work. Any failure
//! leaves every resource untouched.
//!
//! # Usage
//!
//! See [`app::App`] for wiring and the `tests/` directory for contention
//! scenarios.

pub mod app;
pub mod catalog;
pub mod config;
pub mod coupon;
pub mod error;
pub mod order;
pub mod storage;
pub mod types;
pub mod wallet;

pub use app::App;
pub use config::Config;
pub use error::{Classify, ErrorClass};
pub use types::*;
