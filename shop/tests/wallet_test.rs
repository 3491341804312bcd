//! Wallet balance integrity under concurrent charges, debits and refunds.
//!
//! Run with: `cargo test -p shop --test wallet_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use proptest::prelude::*;
use shop::types::{Money, UserId};
use shop::wallet::{TransactionKind, WalletError};

#[derive(Debug, Clone, Copy)]
enum Movement {
    Charge(i64),
    Use(i64),
    Refund(i64),
}

fn movement() -> impl Strategy<Value = Movement> {
    prop_oneof![
        (1_i64..500).prop_map(Movement::Charge),
        (1_i64..500).prop_map(Movement::Use),
        (1_i64..500).prop_map(Movement::Refund),
    ]
}

/// Apply `movements` concurrently; returns `(expected, actual, applied)`.
async fn replay(opening: i64, movements: Vec<Movement>) -> (Money, Money, usize) {
    let shop = common::shop();
    let user = UserId::new(1);
    shop.funded(user, opening).await;

    let mut tasks = Vec::new();
    for movement in movements {
        let wallets = shop.app.wallets.clone();
        tasks.push(tokio::spawn(async move {
            let outcome = match movement {
                Movement::Charge(n) => wallets.charge(user, Money::new(n)).await,
                Movement::Use(n) => wallets.use_points(user, Money::new(n), None).await,
                Movement::Refund(n) => wallets.refund(user, Money::new(n), None).await,
            };
            (movement, outcome)
        }));
    }

    let mut expected = Money::new(opening);
    let mut applied = 1;
    for task in tasks {
        match task.await.unwrap() {
            (Movement::Charge(n) | Movement::Refund(n), Ok(_)) => {
                expected = expected + Money::new(n);
                applied += 1;
            }
            (Movement::Use(n), Ok(_)) => {
                expected = expected - Money::new(n);
                applied += 1;
            }
            (Movement::Use(_), Err(WalletError::InsufficientBalance { .. })) => {}
            (movement, Err(e)) => panic!("{movement:?} failed: {e}"),
        }
    }

    let balance = shop.app.wallets.balance(user).await.unwrap();
    let history = shop.app.wallets.history(user).await.unwrap();
    assert_eq!(history.len(), applied);
    assert_eq!(history.last().unwrap().balance_after, balance);
    (expected, balance, applied)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_movements_lose_no_update(
        opening in 1_i64..2_000,
        movements in prop::collection::vec(movement(), 1..24),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (expected, balance, _) = runtime.block_on(replay(opening, movements));
        prop_assert_eq!(balance, expected);
        prop_assert!(balance >= Money::ZERO);
    }
}

#[tokio::test]
async fn first_charge_opens_the_wallet() {
    let shop = common::shop();
    let user = UserId::new(9);
    assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::ZERO);

    let wallet = shop.app.wallets.charge(user, Money::new(5_000)).await.unwrap();
    assert_eq!(wallet.balance, Money::new(5_000));
    assert_eq!(wallet.user_id, user);

    let history = shop.app.wallets.history(user).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, TransactionKind::Charge);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_charges_open_one_wallet() {
    let shop = common::shop();
    let user = UserId::new(4);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let wallets = shop.app.wallets.clone();
        tasks.push(tokio::spawn(async move { wallets.charge(user, Money::new(100)).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(shop.storage.wallet(user).unwrap().balance, Money::new(800));
}

#[tokio::test]
async fn debits_need_a_funded_wallet() {
    let shop = common::shop();
    let user = UserId::new(2);

    let missing = shop
        .app
        .wallets
        .use_points(user, Money::new(10), None)
        .await
        .unwrap_err();
    assert!(matches!(missing, WalletError::NotFound(u) if u == user));

    shop.funded(user, 100).await;
    let short = shop
        .app
        .wallets
        .use_points(user, Money::new(150), None)
        .await
        .unwrap_err();
    assert!(matches!(
        short,
        WalletError::InsufficientBalance { required, available, .. }
            if required == Money::new(150) && available == Money::new(100)
    ));

    let zero = shop.app.wallets.charge(user, Money::ZERO).await.unwrap_err();
    assert!(matches!(zero, WalletError::InvalidAmount(_)));
    assert_eq!(shop.app.wallets.balance(user).await.unwrap(), Money::new(100));
}
