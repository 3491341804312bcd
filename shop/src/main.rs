//! Flash-sale drill.
//!
//! Opens a limited coupon, lets a crowd of users race for it, then has every
//! user check out a limited product at once. Runs against whatever backends
//! the environment configures (see [`shop::Config`]); with the `in-process`
//! feature, unconfigured locks and events fall back to in-process ones.
//!
//! ```bash
//! RUST_LOG=info cargo run -p shop --features in-process
//! DATABASE_URL=postgres://... REDIS_URL=redis://localhost:6379 cargo run -p shop
//! ```

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use shop::catalog::{CartItem, Product};
use shop::coupon::NewCoupon;
use shop::order::CreateOrderCommand;
use shop::{App, Classify, Config, Money, UserId};
use std::collections::BTreeMap;
use storefront_runtime::metrics::MetricsServer;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHOPPERS: i64 = 50;
const COUPON_UNITS: u32 = 10;
const PRODUCT_STOCK: u32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shop=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        postgres = config.postgres.url.is_some(),
        redis = config.redis.url.is_some(),
        redpanda = config.redpanda.brokers.is_some(),
        lock_wait_ms = config.locks.wait_ms,
        lock_lease_ms = config.locks.lease_ms,
        max_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start().context("failed to start metrics server")?;
    }

    let app = App::from_config(&config)
        .await
        .context("failed to wire services")?;

    // 1. Seed a coupon, a product and the shoppers' wallets and carts
    let now = chrono::Utc::now();
    let coupon = app
        .coupons
        .create_coupon(NewCoupon {
            name: "Flash sale 3000 off".to_string(),
            discount: Money::new(3_000),
            total_quantity: COUPON_UNITS,
            starts_at: now - ChronoDuration::minutes(5),
            ends_at: now + ChronoDuration::days(1),
        })
        .await
        .context("failed to create coupon")?;
    let product = app
        .add_product(Product::new("Limited sneakers", Money::new(15_000), PRODUCT_STOCK))
        .await
        .context("failed to add product")?;

    let mut carts = BTreeMap::new();
    for n in 1..=SHOPPERS {
        let user = UserId::new(n);
        app.wallets
            .charge(user, Money::new(20_000))
            .await
            .context("failed to charge wallet")?;
        let line = app
            .add_to_cart(CartItem::new(user, product.id, 1))
            .await
            .context("failed to fill cart")?;
        carts.insert(user, line.id);
    }
    tracing::info!(coupon_id = %coupon.id, product_id = %product.id, shoppers = SHOPPERS, "Sale seeded");

    // 2. Everyone races for the coupon
    let coupon_id = coupon.id;
    let mut issuing = JoinSet::new();
    for &user in carts.keys() {
        let app = app.clone();
        issuing.spawn(async move { (user, app.coupons.issue_coupon(user, coupon_id).await) });
    }
    let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut holders = Vec::new();
    while let Some(joined) = issuing.join_next().await {
        match joined.context("issuance task failed")? {
            (user, Ok(_)) => {
                holders.push(user);
                *outcomes.entry("issued").or_default() += 1;
            }
            (_, Err(e)) => *outcomes.entry(e.reason()).or_default() += 1,
        }
    }
    tracing::info!(?outcomes, "Coupon race finished");

    // 3. Everyone checks out; coupon holders apply it
    let mut checkouts = JoinSet::new();
    for (&user, &line) in &carts {
        let app = app.clone();
        let coupon = holders.contains(&user).then_some(coupon_id);
        checkouts.spawn(async move {
            app.orders
                .create_order(user, CreateOrderCommand::new(vec![line], coupon))
                .await
        });
    }
    let mut placed = 0_usize;
    let mut rejected: BTreeMap<String, usize> = BTreeMap::new();
    while let Some(joined) = checkouts.join_next().await {
        match joined.context("checkout task failed")? {
            Ok(_) => placed += 1,
            Err(e) => *rejected.entry(e.class().to_string()).or_default() += 1,
        }
    }
    tracing::info!(placed, ?rejected, "Checkout race finished");

    // 4. Anything the event bus refused goes out now
    let relayed = app
        .orders
        .relay_pending(100)
        .await
        .context("failed to relay outbox")?;

    let remaining = app
        .coupons
        .get_coupon(coupon_id)
        .await
        .context("failed to reload coupon")?;
    tracing::info!(
        coupons_left = remaining.available_quantity,
        orders = placed,
        relayed,
        "Drill complete"
    );

    if let Some(snapshot) = metrics.as_ref().and_then(MetricsServer::render) {
        tracing::debug!(bytes = snapshot.len(), "Metrics snapshot rendered");
    }

    Ok(())
}
