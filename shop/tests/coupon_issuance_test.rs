//! Coupon issuance and use under contention.
//!
//! Run with: `cargo test -p shop --test coupon_issuance_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use shop::coupon::{CouponError, CouponStatus};
use shop::types::{OrderId, UserId};
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn never_issues_more_than_the_cap() {
    let shop = common::shop();
    let coupon = shop.coupon(10, 1_000).await;
    let coupon_id = coupon.id;

    let mut tasks = Vec::new();
    for n in 1..=50 {
        let coupons = shop.app.coupons.clone();
        tasks.push(tokio::spawn(async move {
            coupons.issue_coupon(UserId::new(n), coupon_id).await
        }));
    }

    let mut issued = 0;
    let mut sold_out = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => issued += 1,
            Err(CouponError::SoldOut(_)) => sold_out += 1,
            Err(e) => panic!("unexpected issuance error: {e}"),
        }
    }

    assert_eq!(issued, 10);
    assert_eq!(sold_out, 40);

    let stored = shop.storage.coupon(coupon.id).unwrap();
    assert_eq!(stored.available_quantity, 0);
    assert_eq!(stored.status, CouponStatus::SoldOut);
    assert_eq!(shop.storage.grants_of_coupon(coupon.id).len(), 10);
    assert_eq!(shop.coordination.locked_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn one_grant_per_user() {
    let shop = common::shop();
    let coupon = shop.coupon(100, 1_000).await;
    let coupon_id = coupon.id;
    let user = UserId::new(7);

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let coupons = shop.app.coupons.clone();
        tasks.push(tokio::spawn(async move { coupons.issue_coupon(user, coupon_id).await }));
    }

    let mut issued = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => issued += 1,
            Err(CouponError::AlreadyIssued { .. }) => duplicates += 1,
            Err(e) => panic!("unexpected issuance error: {e}"),
        }
    }

    assert_eq!(issued, 1);
    assert_eq!(duplicates, 11);
    assert_eq!(shop.storage.coupon(coupon.id).unwrap().available_quantity, 99);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn a_grant_is_spent_once() {
    let shop = common::shop();
    let coupon = shop.coupon(5, 1_000).await;
    let grant = shop
        .app
        .coupons
        .issue_coupon(UserId::new(1), coupon.id)
        .await
        .unwrap();

    let grant_id = grant.id;

    let attempts: Vec<OrderId> = (100..110).map(OrderId::new).collect();
    let mut tasks = Vec::new();
    for &order in &attempts {
        let coupons = shop.app.coupons.clone();
        tasks.push(tokio::spawn(async move { coupons.use_coupon(grant_id, order).await }));
    }

    let mut used = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => used += 1,
            Err(CouponError::AlreadyUsed(id)) => {
                assert_eq!(id, grant.id);
                rejected += 1;
            }
            Err(e) => panic!("unexpected use error: {e}"),
        }
    }

    assert_eq!(used, 1);
    assert_eq!(rejected, 9);

    let stored = shop.storage.grant(grant.id).unwrap();
    assert!(stored.used);
    assert!(attempts.contains(&stored.order_id.unwrap()));
    assert_eq!(stored.version, grant.version + 1);
}

#[tokio::test]
async fn disabled_coupon_cannot_be_issued() {
    let shop = common::shop();
    let coupon = shop.coupon(5, 1_000).await;

    let disabled = shop.app.coupons.disable_coupon(coupon.id).await.unwrap();
    assert_eq!(disabled.status, CouponStatus::Disabled);

    let err = shop
        .app
        .coupons
        .issue_coupon(UserId::new(1), coupon.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CouponError::NotActive(id) if id == coupon.id));
    assert!(shop.app.coupons.list_issuable().await.unwrap().is_empty());
    assert_eq!(shop.app.coupons.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_coupon_is_not_found() {
    let shop = common::shop();
    let err = shop
        .app
        .coupons
        .issue_coupon(UserId::new(1), shop::types::CouponId::new(404))
        .await
        .unwrap_err();
    assert!(matches!(err, CouponError::NotFound(_)));
}

#[tokio::test]
async fn cancelling_an_issuance_restores_a_unit() {
    let shop = common::shop();
    let coupon = shop.coupon(1, 1_000).await;
    let grant = shop
        .app
        .coupons
        .issue_coupon(UserId::new(1), coupon.id)
        .await
        .unwrap();
    assert_eq!(
        shop.app.coupons.get_coupon(coupon.id).await.unwrap().status,
        CouponStatus::SoldOut
    );

    let restored = shop.app.coupons.cancel_issuance(grant.id).await.unwrap();
    assert_eq!(restored.available_quantity, 1);
    assert_eq!(restored.status, CouponStatus::Active);
    assert!(shop.storage.grant(grant.id).is_none());

    // The unit can go to someone else now.
    let second = shop
        .app
        .coupons
        .issue_coupon(UserId::new(2), coupon.id)
        .await
        .unwrap();
    shop.app
        .coupons
        .use_coupon(second.id, OrderId::new(1))
        .await
        .unwrap();
    let err = shop.app.coupons.cancel_issuance(second.id).await.unwrap_err();
    assert!(matches!(err, CouponError::AlreadyUsed(_)));
}

#[tokio::test]
async fn my_coupons_hides_used_grants_unless_asked() {
    let shop = common::shop();
    let user = UserId::new(3);
    let first = shop.coupon(5, 1_000).await;
    let second = shop.coupon(5, 2_000).await;

    let spent = shop.app.coupons.issue_coupon(user, first.id).await.unwrap();
    shop.app.coupons.issue_coupon(user, second.id).await.unwrap();
    shop.app
        .coupons
        .use_coupon(spent.id, OrderId::new(1))
        .await
        .unwrap();

    let unused = shop.app.coupons.my_coupons(user, false).await.unwrap();
    assert_eq!(unused.len(), 1);
    assert_eq!(unused[0].coupon.id, second.id);

    let all: HashSet<_> = shop
        .app
        .coupons
        .my_coupons(user, true)
        .await
        .unwrap()
        .into_iter()
        .map(|owned| owned.grant.coupon_id)
        .collect();
    assert_eq!(all, HashSet::from([first.id, second.id]));

    assert!(shop.app.coupons.find_usable_grant(user, first.id).await.unwrap().is_none());
    assert!(shop.app.coupons.find_usable_grant(user, second.id).await.unwrap().is_some());
}
