//! Checkout across wallet, stock and coupon grant.
//!
//! Run with: `cargo test -p shop --test order_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use shop::coupon::CouponError;
use shop::order::{CreateOrderCommand, OrderError, OrderStatus};
use shop::types::{CouponId, Money, OrderId, UserId};
use shop::{Classify, ErrorClass};

#[tokio::test]
async fn checkout_takes_every_resource() {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, 30_000).await;
    let product = shop.product(10_000, 5).await;
    let line = shop.cart_line(user, &product, 2).await;
    let coupon = shop.coupon(3, 3_000).await;
    let grant = shop.app.coupons.issue_coupon(user, coupon.id).await.unwrap();

    // The wallet and grant locks are re-entered from inside the checkout.
    let order = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], Some(coupon.id)))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.total_amount, Money::new(20_000));
    assert_eq!(order.discount_amount, Money::new(3_000));
    assert_eq!(order.final_amount, Money::new(17_000));
    assert_eq!(order.coupon_grant_id, Some(grant.id));
    assert!(order.order_number.starts_with("ORDER-20250101000000-"));

    assert_eq!(shop.storage.product(product.id).unwrap().stock, 3);
    assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::new(13_000));
    let spent = shop.storage.grant(grant.id).unwrap();
    assert!(spent.used);
    assert_eq!(spent.order_id, Some(order.id));

    let history = shop.app.wallets.history(user).await.unwrap();
    assert_eq!(history.last().unwrap().order_id, Some(order.id));

    assert_eq!(shop.events.published_to(common::TOPIC).len(), 1);
    assert!(shop.storage.outbox().iter().all(|row| row.published));
    assert_eq!(shop.coordination.locked_keys(), 0);

    // The cart line is gone.
    let again = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], None))
        .await
        .unwrap_err();
    assert!(matches!(again, OrderError::CartItemNotFound(id) if id == line));
}

#[tokio::test]
async fn discount_never_exceeds_the_total() {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, 1).await;
    let product = shop.product(500, 1).await;
    let line = shop.cart_line(user, &product, 1).await;
    let coupon = shop.coupon(1, 2_000).await;
    shop.app.coupons.issue_coupon(user, coupon.id).await.unwrap();

    let order = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], Some(coupon.id)))
        .await
        .unwrap();

    assert_eq!(order.discount_amount, Money::new(500));
    assert_eq!(order.final_amount, Money::ZERO);
    assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::new(1));
}

#[tokio::test]
async fn rejected_checkout_changes_nothing() {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, 5_000).await;
    let product = shop.product(10_000, 5).await;
    let line = shop.cart_line(user, &product, 1).await;
    let coupon = shop.coupon(1, 1_000).await;
    let grant = shop.app.coupons.issue_coupon(user, coupon.id).await.unwrap();

    let err = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], Some(coupon.id)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrderError::InsufficientBalance { required, available, .. }
            if required == Money::new(9_000) && available == Money::new(5_000)
    ));
    assert_eq!(err.class(), ErrorClass::ClientError);
    assert_eq!(shop.storage.product(product.id).unwrap().stock, 5);
    assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::new(5_000));
    assert!(!shop.storage.grant(grant.id).unwrap().used);
    assert_eq!(shop.storage.order_count(), 0);
    assert!(shop.storage.outbox().is_empty());
    assert!(shop.events.is_empty());
    assert_eq!(shop.coordination.locked_keys(), 0);
}

#[tokio::test]
async fn spent_grant_is_not_usable() {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, 50_000).await;
    let product = shop.product(10_000, 5).await;
    let line = shop.cart_line(user, &product, 1).await;
    let coupon = shop.coupon(1, 1_000).await;
    let grant = shop.app.coupons.issue_coupon(user, coupon.id).await.unwrap();

    // Spent on another order first.
    shop.app
        .coupons
        .use_coupon(grant.id, OrderId::new(999))
        .await
        .unwrap();

    let err = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], Some(coupon.id)))
        .await
        .unwrap_err();

    assert!(matches!(err, OrderError::CouponInvalid(id) if id == coupon.id));
    assert_eq!(shop.storage.product(product.id).unwrap().stock, 5);
    assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::new(50_000));
    assert_eq!(shop.storage.order_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn last_unit_goes_to_one_buyer() {
    let shop = common::shop();
    let product = shop.product(1_000, 1).await;

    let mut tasks = Vec::new();
    for n in 1..=6 {
        let user = UserId::new(n);
        shop.funded(user, 10_000).await;
        let line = shop.cart_line(user, &product, 1).await;
        let orders = shop.app.orders.clone();
        tasks.push(tokio::spawn(async move {
            (user, orders.create_order(user, CreateOrderCommand::new(vec![line], None)).await)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            (user, Ok(_)) => winners.push(user),
            (_, Err(OrderError::InsufficientStock { available, .. })) => assert_eq!(available, 0),
            (_, Err(e)) => panic!("unexpected checkout error: {e}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(shop.storage.product(product.id).unwrap().stock, 0);
    for n in 1..=6 {
        let user = UserId::new(n);
        let expected = if winners.contains(&user) { 9_000 } else { 10_000 };
        assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::new(expected));
    }
}

#[tokio::test]
async fn validation_happens_before_locking() {
    let shop = common::shop();
    let owner = UserId::new(1);
    let intruder = UserId::new(2);
    shop.funded(owner, 10_000).await;
    shop.funded(intruder, 10_000).await;
    let product = shop.product(1_000, 3).await;
    let line = shop.cart_line(owner, &product, 1).await;

    let empty = shop
        .app
        .orders
        .create_order(owner, CreateOrderCommand::new(vec![], None))
        .await
        .unwrap_err();
    assert!(matches!(empty, OrderError::EmptyCart));

    let no_wallet = shop
        .app
        .orders
        .create_order(UserId::new(3), CreateOrderCommand::new(vec![line], None))
        .await
        .unwrap_err();
    assert!(matches!(no_wallet, OrderError::WalletNotFound(_)));

    let not_owned = shop
        .app
        .orders
        .create_order(intruder, CreateOrderCommand::new(vec![line], None))
        .await
        .unwrap_err();
    assert!(matches!(not_owned, OrderError::CartItemNotOwned { .. }));

    let no_grant = shop
        .app
        .orders
        .create_order(owner, CreateOrderCommand::new(vec![line], Some(CouponId::new(77))))
        .await
        .unwrap_err();
    assert!(matches!(no_grant, OrderError::CouponInvalid(_)));
    assert_eq!(no_grant.class(), ErrorClass::ClientError);

    assert_eq!(shop.storage.product(product.id).unwrap().stock, 3);
}

#[tokio::test]
async fn failed_publish_keeps_the_order_for_relay() {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, 10_000).await;
    let product = shop.product(2_000, 2).await;
    let line = shop.cart_line(user, &product, 1).await;

    shop.events.set_failing(true);
    let order = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], None))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Paid);
    assert!(shop.events.is_empty());
    let pending = shop.storage.outbox();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].published);
    assert_eq!(pending[0].order_id, order.id);

    assert_eq!(shop.app.orders.relay_pending(10).await.unwrap(), 0);

    shop.events.set_failing(false);
    assert_eq!(shop.app.orders.relay_pending(10).await.unwrap(), 1);
    assert_eq!(shop.events.published_to(common::TOPIC).len(), 1);
    assert!(shop.storage.outbox()[0].published);
    assert_eq!(shop.app.orders.relay_pending(10).await.unwrap(), 0);
}

#[tokio::test]
async fn relay_drains_backlog_oldest_first_within_limit() {
    let shop = common::shop();
    let product = shop.product(1_000, 4).await;
    shop.events.set_failing(true);

    let mut placed = Vec::new();
    for n in 1..=2 {
        let user = UserId::new(n);
        shop.funded(user, 5_000).await;
        let line = shop.cart_line(user, &product, 1).await;
        let order = shop
            .app
            .orders
            .create_order(user, CreateOrderCommand::new(vec![line], None))
            .await
            .unwrap();
        placed.push(order.id);
    }
    assert!(shop.events.is_empty());
    assert!(shop.storage.outbox().iter().all(|e| !e.published));

    shop.events.set_failing(false);
    assert_eq!(shop.app.orders.relay_pending(1).await.unwrap(), 1);
    let outbox = shop.storage.outbox();
    assert!(outbox[0].published);
    assert_eq!(outbox[0].order_id, placed[0]);
    assert!(!outbox[1].published);

    assert_eq!(shop.app.orders.relay_pending(1).await.unwrap(), 1);
    assert!(shop.storage.outbox().iter().all(|e| e.published));
    assert_eq!(shop.events.published_to(common::TOPIC).len(), 2);
}

#[tokio::test]
async fn status_moves_forward_only() {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, 10_000).await;
    let product = shop.product(2_000, 2).await;
    let line = shop.cart_line(user, &product, 1).await;
    let order = shop
        .app
        .orders
        .create_order(user, CreateOrderCommand::new(vec![line], None))
        .await
        .unwrap();

    let completed = shop
        .app
        .orders
        .update_status(order.id, OrderStatus::Completed)
        .await
        .unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);

    let err = shop
        .app
        .orders
        .update_status(order.id, OrderStatus::Paid)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidStatusTransition { .. }));

    let mine = shop.app.orders.orders_for_user(user).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(shop.app.orders.get_order(order.id).await.unwrap().items.len(), 1);

    let missing = shop.app.orders.get_order(OrderId::new(12_345)).await.unwrap_err();
    assert!(matches!(missing, OrderError::NotFound(_)));
}

#[test]
fn coupon_errors_surface_through_orders() {
    let err = OrderError::from(CouponError::AlreadyUsed(shop::types::GrantId::new(1)));
    assert_eq!(err.class(), ErrorClass::Conflict);
}
