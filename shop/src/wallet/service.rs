//! Point wallet operations.
//!
//! Charges, debits and refunds each take the user's wallet lock and replay the
//! read-modify-write on version conflicts. The `_in` variants run inside a
//! caller's unit of work and re-enter a lock the caller already holds.

use super::{TransactionKind, Wallet, WalletError, WalletTransaction};
use crate::storage::{Storage, StoreError, UnitOfWork};
use crate::types::{Money, OrderId, UserId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::lock::LockRequestSet;
use storefront_runtime::{LockExecutor, OptimisticRetry};

/// Wallet operations.
///
/// Every balance change runs under `lock:point:user:{user}` and is replayed on
/// version conflicts, so concurrent charges and debits never lose an update.
#[derive(Clone)]
pub struct WalletService {
    storage: Arc<dyn Storage>,
    locks: LockExecutor,
    retry: OptimisticRetry,
    clock: Arc<dyn Clock>,
}

impl WalletService {
    /// Create a service.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        locks: LockExecutor,
        retry: OptimisticRetry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            locks,
            retry,
            clock,
        }
    }

    /// Add `amount` to `user`'s wallet, opening it on first charge.
    ///
    /// # Errors
    ///
    /// [`WalletError::InvalidAmount`] unless `amount > 0`.
    pub async fn charge(&self, user: UserId, amount: Money) -> Result<Wallet, WalletError> {
        self.transact(user, TransactionKind::Charge, amount, None).await
    }

    /// Spend `amount` from `user`'s wallet.
    ///
    /// # Errors
    ///
    /// [`WalletError::NotFound`], [`WalletError::InvalidAmount`] or
    /// [`WalletError::InsufficientBalance`].
    pub async fn use_points(
        &self,
        user: UserId,
        amount: Money,
        order: Option<OrderId>,
    ) -> Result<Wallet, WalletError> {
        self.transact(user, TransactionKind::Use, amount, order).await
    }

    /// Spend `amount` inside the caller's unit of work, re-entering the wallet
    /// lock when the caller already holds it.
    ///
    /// # Errors
    ///
    /// Same as [`use_points`](Self::use_points).
    pub async fn use_points_in(
        &self,
        uow: &mut dyn UnitOfWork,
        user: UserId,
        amount: Money,
        order: OrderId,
    ) -> Result<Wallet, WalletError> {
        require_positive(amount)?;
        let keys = wallet_keys(user);
        let now = self.clock.now();
        self.locks
            .run(&keys, move || async move {
                self.retry
                    .run_in(uow, move |uow| {
                        Box::pin(apply(uow, user, TransactionKind::Use, amount, Some(order), now))
                    })
                    .await
            })
            .await
    }

    /// Return `amount` to `user`'s wallet.
    ///
    /// # Errors
    ///
    /// [`WalletError::NotFound`] or [`WalletError::InvalidAmount`].
    pub async fn refund(
        &self,
        user: UserId,
        amount: Money,
        order: Option<OrderId>,
    ) -> Result<Wallet, WalletError> {
        self.transact(user, TransactionKind::Refund, amount, order).await
    }

    /// Current balance; zero for a user without a wallet.
    ///
    /// # Errors
    ///
    /// [`WalletError::Store`] on storage failure.
    pub async fn balance(&self, user: UserId) -> Result<Money, WalletError> {
        let mut uow = self.storage.begin().await?;
        Ok(uow
            .find_wallet(user)
            .await?
            .map_or(Money::ZERO, |wallet| wallet.balance))
    }

    /// Ledger of `user`, oldest first.
    ///
    /// # Errors
    ///
    /// [`WalletError::Store`] on storage failure.
    pub async fn history(&self, user: UserId) -> Result<Vec<WalletTransaction>, WalletError> {
        let mut uow = self.storage.begin().await?;
        Ok(uow.wallet_transactions(user).await?)
    }

    async fn transact(
        &self,
        user: UserId,
        kind: TransactionKind,
        amount: Money,
        order: Option<OrderId>,
    ) -> Result<Wallet, WalletError> {
        require_positive(amount)?;
        let keys = wallet_keys(user);

        let wallet = self
            .locks
            .run(&keys, move || async move {
                self.retry
                    .run(move || async move {
                        let now = self.clock.now();
                        let mut uow = self.storage.begin().await?;
                        let wallet = apply(uow.as_mut(), user, kind, amount, order, now).await?;
                        uow.commit().await?;
                        Ok::<_, WalletError>(wallet)
                    })
                    .await
            })
            .await?;

        tracing::info!(
            user_id = %user,
            kind = %kind,
            amount = %amount,
            balance = %wallet.balance,
            "Wallet updated"
        );
        Ok(wallet)
    }
}

fn wallet_keys(user: UserId) -> Vec<String> {
    LockRequestSet::new()
        .with_wallet(user.lock_id())
        .build_sorted_keys()
}

const fn require_positive(amount: Money) -> Result<(), WalletError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(WalletError::InvalidAmount(amount))
    }
}

/// Apply one balance movement and append its ledger entry.
async fn apply<U: UnitOfWork + ?Sized>(
    uow: &mut U,
    user: UserId,
    kind: TransactionKind,
    amount: Money,
    order: Option<OrderId>,
    now: DateTime<Utc>,
) -> Result<Wallet, WalletError> {
    let current = uow.find_wallet(user).await?;
    let wallet = match (current, kind) {
        (Some(wallet), TransactionKind::Charge) => {
            uow.save_wallet(&wallet.charge(amount, now)?).await?
        }
        (Some(wallet), TransactionKind::Use) => {
            uow.save_wallet(&wallet.use_points(amount, now)?).await?
        }
        (Some(wallet), TransactionKind::Refund) => {
            uow.save_wallet(&wallet.refund(amount, now)?).await?
        }
        (None, TransactionKind::Charge) => {
            let opened = Wallet::open(user, now).charge(amount, now)?;
            match uow.insert_wallet(&opened).await {
                Ok(wallet) => wallet,
                // Someone else opened it first; replay against their row.
                Err(StoreError::UniqueViolation { .. }) => {
                    return Err(StoreError::VersionConflict {
                        entity: "wallet",
                        id: user.get(),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        (None, _) => return Err(WalletError::NotFound(user)),
    };

    uow.append_wallet_transaction(&WalletTransaction::record(&wallet, kind, amount, order))
        .await?;
    Ok(wallet)
}
