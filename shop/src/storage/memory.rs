//! In-memory storage.
//!
//! Committed rows live in one set of tables behind a mutex. A unit of work
//! reads committed rows overlaid with its own staged rows (read committed),
//! records every write in order, and on commit replays the writes against a
//! copy of the tables, re-running version, uniqueness and stock checks. Either
//! every write lands or none does.
//!
//! `find_coupon_for_update` takes a per-row async mutex held until the unit of
//! work ends, like `SELECT ... FOR UPDATE`.

use super::{
    CatalogRepository, CouponRepository, GrantRepository, OrderRepository, Storage, StoreError,
    StoreFuture, UnitOfWork, WalletRepository,
};
use crate::catalog::{CartItem, Product};
use crate::coupon::{Coupon, CouponGrant};
use crate::order::{Order, OutboxEvent};
use crate::types::{CartItemId, CouponId, GrantId, OrderId, ProductId, UserId, WalletId};
use crate::wallet::{Wallet, WalletTransaction};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

const GRANT_UNIQUE: &str = "coupon_grants_user_coupon_key";
const WALLET_UNIQUE: &str = "wallets_user_id_key";

#[derive(Clone, Debug, Default)]
struct Tables {
    coupons: BTreeMap<CouponId, Coupon>,
    grants: BTreeMap<GrantId, CouponGrant>,
    wallets: BTreeMap<UserId, Wallet>,
    wallet_transactions: Vec<WalletTransaction>,
    products: BTreeMap<ProductId, Product>,
    cart_items: BTreeMap<CartItemId, CartItem>,
    orders: BTreeMap<OrderId, Order>,
    outbox: BTreeMap<i64, OutboxEvent>,
}

/// Rows written by one unit of work; `None` marks a deletion.
#[derive(Debug, Default)]
struct Staged {
    coupons: BTreeMap<CouponId, Option<Coupon>>,
    grants: BTreeMap<GrantId, Option<CouponGrant>>,
    wallets: BTreeMap<UserId, Option<Wallet>>,
    wallet_transactions: Vec<WalletTransaction>,
    products: BTreeMap<ProductId, Option<Product>>,
    cart_items: BTreeMap<CartItemId, Option<CartItem>>,
    orders: BTreeMap<OrderId, Option<Order>>,
    outbox: BTreeMap<i64, Option<OutboxEvent>>,
}

#[derive(Debug)]
enum Write {
    InsertCoupon(Coupon),
    SaveCoupon(Coupon),
    InsertGrant(CouponGrant),
    SaveGrant(CouponGrant),
    DeleteGrant(GrantId),
    InsertWallet(Wallet),
    SaveWallet(Wallet),
    AppendWalletTransaction(WalletTransaction),
    InsertProduct(Product),
    InsertCartItem(CartItem),
    DecrementStock(ProductId, u32),
    RemoveCartItems(UserId, Vec<CartItemId>),
    InsertOrder(Order),
    SaveOrder(Order),
    AppendOutbox(OutboxEvent),
    MarkOutboxPublished(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RowKey {
    Coupon(CouponId),
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicI64,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// [`Storage`] kept in process memory.
///
/// Clones share the same tables.
///
/// # Example
///
/// ```
/// use shop::storage::{InMemoryStorage, Storage};
/// use shop::catalog::Product;
/// use shop::types::Money;
///
/// # async fn example() -> Result<(), shop::storage::StoreError> {
/// let storage = InMemoryStorage::new();
/// let mut uow = storage.begin().await?;
/// let product = uow.insert_product(&Product::new("Keyboard", Money::new(30_000), 5)).await?;
/// uow.commit().await?;
///
/// assert_eq!(storage.product(product.id).map(|p| p.stock), Some(5));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStorage {
    shared: Arc<Shared>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// Committed coupon.
    #[must_use]
    pub fn coupon(&self, id: CouponId) -> Option<Coupon> {
        self.shared.tables().coupons.get(&id).cloned()
    }

    /// Committed grants of `coupon`.
    #[must_use]
    pub fn grants_of_coupon(&self, coupon: CouponId) -> Vec<CouponGrant> {
        self.shared
            .tables()
            .grants
            .values()
            .filter(|g| g.coupon_id == coupon)
            .cloned()
            .collect()
    }

    /// Committed grant.
    #[must_use]
    pub fn grant(&self, id: GrantId) -> Option<CouponGrant> {
        self.shared.tables().grants.get(&id).cloned()
    }

    /// Committed wallet of `user`.
    #[must_use]
    pub fn wallet(&self, user: UserId) -> Option<Wallet> {
        self.shared.tables().wallets.get(&user).cloned()
    }

    /// Committed product.
    #[must_use]
    pub fn product(&self, id: ProductId) -> Option<Product> {
        self.shared.tables().products.get(&id).cloned()
    }

    /// Number of committed orders.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.shared.tables().orders.len()
    }

    /// Committed outbox rows, oldest first.
    #[must_use]
    pub fn outbox(&self) -> Vec<OutboxEvent> {
        self.shared.tables().outbox.values().cloned().collect()
    }
}

impl Storage for InMemoryStorage {
    fn begin(&self) -> StoreFuture<'_, Box<dyn UnitOfWork>> {
        let uow: Box<dyn UnitOfWork> = Box::new(MemoryUnitOfWork {
            shared: Arc::clone(&self.shared),
            staged: Staged::default(),
            writes: Vec::new(),
            held: HashMap::new(),
        });
        Box::pin(std::future::ready(Ok(uow)))
    }
}

struct MemoryUnitOfWork {
    shared: Arc<Shared>,
    staged: Staged,
    writes: Vec<Write>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

fn read<K: Ord, V: Clone>(committed: &BTreeMap<K, V>, staged: &BTreeMap<K, Option<V>>, key: &K) -> Option<V> {
    match staged.get(key) {
        Some(row) => row.clone(),
        None => committed.get(key).cloned(),
    }
}

fn merged<K: Ord + Clone, V: Clone>(
    committed: &BTreeMap<K, V>,
    staged: &BTreeMap<K, Option<V>>,
) -> Vec<V> {
    let mut rows: BTreeMap<K, V> = committed.clone();
    for (key, row) in staged {
        match row {
            Some(row) => {
                rows.insert(key.clone(), row.clone());
            }
            None => {
                rows.remove(key);
            }
        }
    }
    rows.into_values().collect()
}

fn ready<T: Send + 'static>(result: Result<T, StoreError>) -> StoreFuture<'static, T> {
    Box::pin(std::future::ready(result))
}

fn check_version(entity: &'static str, id: i64, stored: Option<i64>, next: i64) -> Result<(), StoreError> {
    match stored {
        Some(version) if version + 1 == next => Ok(()),
        Some(_) => Err(StoreError::VersionConflict { entity, id }),
        None => Err(StoreError::RowNotFound { entity, id }),
    }
}

impl MemoryUnitOfWork {
    async fn lock_row(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let row = {
            let mut locks = self
                .shared
                .row_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        let guard = row.lock_owned().await;
        self.held.insert(key, guard);
    }

    fn coupon(&self, id: CouponId) -> Option<Coupon> {
        read(&self.shared.tables().coupons, &self.staged.coupons, &id)
    }

    fn grant(&self, id: GrantId) -> Option<CouponGrant> {
        read(&self.shared.tables().grants, &self.staged.grants, &id)
    }

    fn grants(&self) -> Vec<CouponGrant> {
        merged(&self.shared.tables().grants, &self.staged.grants)
    }

    fn wallet(&self, user: UserId) -> Option<Wallet> {
        read(&self.shared.tables().wallets, &self.staged.wallets, &user)
    }

    fn product(&self, id: ProductId) -> Option<Product> {
        read(&self.shared.tables().products, &self.staged.products, &id)
    }

    fn order(&self, id: OrderId) -> Option<Order> {
        read(&self.shared.tables().orders, &self.staged.orders, &id)
    }

    fn stage_coupon(&mut self, coupon: Coupon) {
        self.staged.coupons.insert(coupon.id, Some(coupon));
    }
}

impl CouponRepository for MemoryUnitOfWork {
    fn find_coupon_for_update(&mut self, id: CouponId) -> StoreFuture<'_, Option<Coupon>> {
        Box::pin(async move {
            self.lock_row(RowKey::Coupon(id)).await;
            Ok(self.coupon(id))
        })
    }

    fn find_coupon(&mut self, id: CouponId) -> StoreFuture<'_, Option<Coupon>> {
        ready(Ok(self.coupon(id)))
    }

    fn insert_coupon(&mut self, coupon: &Coupon) -> StoreFuture<'_, Coupon> {
        let mut coupon = coupon.clone();
        coupon.id = CouponId::new(self.shared.next_id());
        self.stage_coupon(coupon.clone());
        self.writes.push(Write::InsertCoupon(coupon.clone()));
        ready(Ok(coupon))
    }

    fn save_coupon(&mut self, coupon: &Coupon) -> StoreFuture<'_, Coupon> {
        let stored = self.coupon(coupon.id).map(|c| c.version);
        let result = check_version("coupon", coupon.id.get(), stored, coupon.version).map(|()| {
            self.stage_coupon(coupon.clone());
            self.writes.push(Write::SaveCoupon(coupon.clone()));
            coupon.clone()
        });
        ready(result)
    }

    fn find_all_coupons(&mut self) -> StoreFuture<'_, Vec<Coupon>> {
        ready(Ok(merged(&self.shared.tables().coupons, &self.staged.coupons)))
    }

    fn find_issuable_coupons(&mut self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<Coupon>> {
        let coupons = merged(&self.shared.tables().coupons, &self.staged.coupons)
            .into_iter()
            .filter(|c| c.is_issuable(now))
            .collect();
        ready(Ok(coupons))
    }
}

impl GrantRepository for MemoryUnitOfWork {
    fn find_grant_by_user_and_coupon(
        &mut self,
        user: UserId,
        coupon: CouponId,
    ) -> StoreFuture<'_, Option<CouponGrant>> {
        let grant = self
            .grants()
            .into_iter()
            .find(|g| g.user_id == user && g.coupon_id == coupon);
        ready(Ok(grant))
    }

    fn find_grant(&mut self, id: GrantId) -> StoreFuture<'_, Option<CouponGrant>> {
        ready(Ok(self.grant(id)))
    }

    fn find_grants_by_user(&mut self, user: UserId) -> StoreFuture<'_, Vec<CouponGrant>> {
        let grants = self.grants().into_iter().filter(|g| g.user_id == user).collect();
        ready(Ok(grants))
    }

    fn insert_grant(&mut self, grant: &CouponGrant) -> StoreFuture<'_, CouponGrant> {
        let duplicate = self
            .grants()
            .iter()
            .any(|g| g.user_id == grant.user_id && g.coupon_id == grant.coupon_id);
        if duplicate {
            return ready(Err(StoreError::UniqueViolation {
                constraint: GRANT_UNIQUE.to_string(),
            }));
        }
        let mut grant = grant.clone();
        grant.id = GrantId::new(self.shared.next_id());
        self.staged.grants.insert(grant.id, Some(grant.clone()));
        self.writes.push(Write::InsertGrant(grant.clone()));
        ready(Ok(grant))
    }

    fn save_grant(&mut self, grant: &CouponGrant) -> StoreFuture<'_, CouponGrant> {
        let stored = self.grant(grant.id).map(|g| g.version);
        let result = check_version("grant", grant.id.get(), stored, grant.version).map(|()| {
            self.staged.grants.insert(grant.id, Some(grant.clone()));
            self.writes.push(Write::SaveGrant(grant.clone()));
            grant.clone()
        });
        ready(result)
    }

    fn delete_grant(&mut self, id: GrantId) -> StoreFuture<'_, ()> {
        self.staged.grants.insert(id, None);
        self.writes.push(Write::DeleteGrant(id));
        ready(Ok(()))
    }
}

impl WalletRepository for MemoryUnitOfWork {
    fn find_wallet(&mut self, user: UserId) -> StoreFuture<'_, Option<Wallet>> {
        ready(Ok(self.wallet(user)))
    }

    fn insert_wallet(&mut self, wallet: &Wallet) -> StoreFuture<'_, Wallet> {
        if self.wallet(wallet.user_id).is_some() {
            return ready(Err(StoreError::UniqueViolation {
                constraint: WALLET_UNIQUE.to_string(),
            }));
        }
        let mut wallet = wallet.clone();
        wallet.id = WalletId::new(self.shared.next_id());
        self.staged.wallets.insert(wallet.user_id, Some(wallet.clone()));
        self.writes.push(Write::InsertWallet(wallet.clone()));
        ready(Ok(wallet))
    }

    fn save_wallet(&mut self, wallet: &Wallet) -> StoreFuture<'_, Wallet> {
        let stored = self.wallet(wallet.user_id).map(|w| w.version);
        let result = check_version("wallet", wallet.id.get(), stored, wallet.version).map(|()| {
            self.staged.wallets.insert(wallet.user_id, Some(wallet.clone()));
            self.writes.push(Write::SaveWallet(wallet.clone()));
            wallet.clone()
        });
        ready(result)
    }

    fn append_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> StoreFuture<'_, WalletTransaction> {
        let mut entry = entry.clone();
        entry.id = self.shared.next_id();
        self.staged.wallet_transactions.push(entry.clone());
        self.writes.push(Write::AppendWalletTransaction(entry.clone()));
        ready(Ok(entry))
    }

    fn wallet_transactions(&mut self, user: UserId) -> StoreFuture<'_, Vec<WalletTransaction>> {
        let entries = self
            .shared
            .tables()
            .wallet_transactions
            .iter()
            .chain(self.staged.wallet_transactions.iter())
            .filter(|t| t.user_id == user)
            .cloned()
            .collect();
        ready(Ok(entries))
    }
}

impl CatalogRepository for MemoryUnitOfWork {
    fn cart_items(&mut self, ids: &[CartItemId]) -> StoreFuture<'_, Vec<CartItem>> {
        let items = {
            let tables = self.shared.tables();
            ids.iter()
                .filter_map(|id| read(&tables.cart_items, &self.staged.cart_items, id))
                .collect()
        };
        ready(Ok(items))
    }

    fn products(&mut self, ids: &[ProductId]) -> StoreFuture<'_, Vec<Product>> {
        let products = ids.iter().filter_map(|id| self.product(*id)).collect();
        ready(Ok(products))
    }

    fn decrement_stock(&mut self, product: ProductId, quantity: u32) -> StoreFuture<'_, bool> {
        let result = match self.product(product) {
            Some(mut row) if row.stock >= quantity => {
                row.stock -= quantity;
                self.staged.products.insert(product, Some(row));
                self.writes.push(Write::DecrementStock(product, quantity));
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::RowNotFound {
                entity: "product",
                id: product.get(),
            }),
        };
        ready(result)
    }

    fn remove_cart_items(&mut self, user: UserId, ids: &[CartItemId]) -> StoreFuture<'_, ()> {
        let owned: Vec<CartItemId> = {
            let tables = self.shared.tables();
            ids.iter()
                .filter(|id| {
                    read(&tables.cart_items, &self.staged.cart_items, id)
                        .is_some_and(|item| item.user_id == user)
                })
                .copied()
                .collect()
        };
        for id in &owned {
            self.staged.cart_items.insert(*id, None);
        }
        self.writes.push(Write::RemoveCartItems(user, owned));
        ready(Ok(()))
    }

    fn insert_product(&mut self, product: &Product) -> StoreFuture<'_, Product> {
        let mut product = product.clone();
        product.id = ProductId::new(self.shared.next_id());
        self.staged.products.insert(product.id, Some(product.clone()));
        self.writes.push(Write::InsertProduct(product.clone()));
        ready(Ok(product))
    }

    fn insert_cart_item(&mut self, item: &CartItem) -> StoreFuture<'_, CartItem> {
        let mut item = item.clone();
        item.id = CartItemId::new(self.shared.next_id());
        self.staged.cart_items.insert(item.id, Some(item.clone()));
        self.writes.push(Write::InsertCartItem(item.clone()));
        ready(Ok(item))
    }
}

impl OrderRepository for MemoryUnitOfWork {
    fn insert_order(&mut self, order: &Order) -> StoreFuture<'_, Order> {
        let mut order = order.clone();
        order.id = OrderId::new(self.shared.next_id());
        self.staged.orders.insert(order.id, Some(order.clone()));
        self.writes.push(Write::InsertOrder(order.clone()));
        ready(Ok(order))
    }

    fn save_order(&mut self, order: &Order) -> StoreFuture<'_, Order> {
        if self.order(order.id).is_none() {
            return ready(Err(StoreError::RowNotFound {
                entity: "order",
                id: order.id.get(),
            }));
        }
        self.staged.orders.insert(order.id, Some(order.clone()));
        self.writes.push(Write::SaveOrder(order.clone()));
        ready(Ok(order.clone()))
    }

    fn find_order(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        ready(Ok(self.order(id)))
    }

    fn find_orders_by_user(&mut self, user: UserId) -> StoreFuture<'_, Vec<Order>> {
        let mut orders: Vec<Order> = merged(&self.shared.tables().orders, &self.staged.orders)
            .into_iter()
            .filter(|o| o.user_id == user)
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        ready(Ok(orders))
    }

    fn append_outbox(&mut self, event: &OutboxEvent) -> StoreFuture<'_, OutboxEvent> {
        let mut event = event.clone();
        event.id = self.shared.next_id();
        self.staged.outbox.insert(event.id, Some(event.clone()));
        self.writes.push(Write::AppendOutbox(event.clone()));
        ready(Ok(event))
    }

    fn pending_outbox(&mut self, limit: usize) -> StoreFuture<'_, Vec<OutboxEvent>> {
        let pending = merged(&self.shared.tables().outbox, &self.staged.outbox)
            .into_iter()
            .filter(|e| !e.published)
            .take(limit)
            .collect();
        ready(Ok(pending))
    }

    fn mark_outbox_published(&mut self, id: i64) -> StoreFuture<'_, ()> {
        let row = read(&self.shared.tables().outbox, &self.staged.outbox, &id);
        let result = match row {
            Some(mut event) => {
                event.published = true;
                self.staged.outbox.insert(id, Some(event));
                self.writes.push(Write::MarkOutboxPublished(id));
                Ok(())
            }
            None => Err(StoreError::RowNotFound { entity: "outbox", id }),
        };
        ready(result)
    }
}

impl UnitOfWork for MemoryUnitOfWork {
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        let result = {
            let mut tables = self.shared.tables();
            let mut next = tables.clone();
            let applied = self
                .writes
                .into_iter()
                .try_for_each(|write| apply(&mut next, write));
            if applied.is_ok() {
                *tables = next;
            }
            applied
        };
        // Row locks are released when `self.held` drops here.
        ready(result)
    }
}

fn apply(tables: &mut Tables, write: Write) -> Result<(), StoreError> {
    match write {
        Write::InsertCoupon(coupon) => {
            tables.coupons.insert(coupon.id, coupon);
        }
        Write::SaveCoupon(coupon) => {
            let stored = tables.coupons.get(&coupon.id).map(|c| c.version);
            check_version("coupon", coupon.id.get(), stored, coupon.version)?;
            tables.coupons.insert(coupon.id, coupon);
        }
        Write::InsertGrant(grant) => {
            if tables
                .grants
                .values()
                .any(|g| g.user_id == grant.user_id && g.coupon_id == grant.coupon_id)
            {
                return Err(StoreError::UniqueViolation {
                    constraint: GRANT_UNIQUE.to_string(),
                });
            }
            tables.grants.insert(grant.id, grant);
        }
        Write::SaveGrant(grant) => {
            let stored = tables.grants.get(&grant.id).map(|g| g.version);
            check_version("grant", grant.id.get(), stored, grant.version)?;
            tables.grants.insert(grant.id, grant);
        }
        Write::DeleteGrant(id) => {
            tables.grants.remove(&id);
        }
        Write::InsertWallet(wallet) => {
            if tables.wallets.contains_key(&wallet.user_id) {
                return Err(StoreError::UniqueViolation {
                    constraint: WALLET_UNIQUE.to_string(),
                });
            }
            tables.wallets.insert(wallet.user_id, wallet);
        }
        Write::SaveWallet(wallet) => {
            let stored = tables.wallets.get(&wallet.user_id).map(|w| w.version);
            check_version("wallet", wallet.id.get(), stored, wallet.version)?;
            tables.wallets.insert(wallet.user_id, wallet);
        }
        Write::AppendWalletTransaction(entry) => tables.wallet_transactions.push(entry),
        Write::InsertProduct(product) => {
            tables.products.insert(product.id, product);
        }
        Write::InsertCartItem(item) => {
            tables.cart_items.insert(item.id, item);
        }
        Write::DecrementStock(id, quantity) => match tables.products.get_mut(&id) {
            Some(product) if product.stock >= quantity => product.stock -= quantity,
            Some(_) => {
                return Err(StoreError::VersionConflict {
                    entity: "product",
                    id: id.get(),
                });
            }
            None => {
                return Err(StoreError::RowNotFound {
                    entity: "product",
                    id: id.get(),
                });
            }
        },
        Write::RemoveCartItems(user, ids) => {
            for id in ids {
                if tables.cart_items.get(&id).is_some_and(|i| i.user_id == user) {
                    tables.cart_items.remove(&id);
                }
            }
        }
        Write::InsertOrder(order) | Write::SaveOrder(order) => {
            tables.orders.insert(order.id, order);
        }
        Write::AppendOutbox(event) => {
            tables.outbox.insert(event.id, event);
        }
        Write::MarkOutboxPublished(id) => {
            if let Some(event) = tables.outbox.get_mut(&id) {
                event.published = true;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::coupon::NewCoupon;
    use crate::types::Money;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn new_coupon() -> Coupon {
        let now = Utc::now();
        Coupon::create(
            NewCoupon {
                name: "Flash".to_string(),
                discount: Money::new(1_000),
                total_quantity: 3,
                starts_at: now - Duration::hours(1),
                ends_at: now + Duration::hours(1),
            },
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let storage = InMemoryStorage::new();
        let mut uow = storage.begin().await.unwrap();
        let coupon = uow.insert_coupon(&new_coupon()).await.unwrap();
        assert!(uow.find_coupon(coupon.id).await.unwrap().is_some());
        drop(uow);

        assert!(storage.coupon(coupon.id).is_none());
    }

    #[tokio::test]
    async fn stale_save_is_a_version_conflict() {
        let storage = InMemoryStorage::new();
        let mut setup = storage.begin().await.unwrap();
        let coupon = setup.insert_coupon(&new_coupon()).await.unwrap();
        setup.commit().await.unwrap();

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        let a = first.find_coupon(coupon.id).await.unwrap().unwrap();
        let b = second.find_coupon(coupon.id).await.unwrap().unwrap();

        first.save_coupon(&a.decrease_quantity(Utc::now()).unwrap()).await.unwrap();
        first.commit().await.unwrap();

        let stale = second.save_coupon(&b.decrease_quantity(Utc::now()).unwrap()).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { entity: "coupon", .. })));
        assert_eq!(storage.coupon(coupon.id).unwrap().available_quantity, 2);
    }

    #[tokio::test]
    async fn conflict_found_at_commit_discards_everything() {
        let storage = InMemoryStorage::new();
        let mut setup = storage.begin().await.unwrap();
        let coupon = setup.insert_coupon(&new_coupon()).await.unwrap();
        setup.commit().await.unwrap();

        let mut late = storage.begin().await.unwrap();
        let stale = late.find_coupon(coupon.id).await.unwrap().unwrap();
        late.save_coupon(&stale.decrease_quantity(Utc::now()).unwrap()).await.unwrap();
        let product = late.insert_product(&Product::new("Pen", Money::new(10), 1)).await.unwrap();

        let mut early = storage.begin().await.unwrap();
        early.save_coupon(&stale.disable(Utc::now())).await.unwrap();
        early.commit().await.unwrap();

        assert!(matches!(late.commit().await, Err(StoreError::VersionConflict { .. })));
        assert!(storage.product(product.id).is_none());
    }

    #[tokio::test]
    async fn duplicate_grant_is_a_unique_violation() {
        let storage = InMemoryStorage::new();
        let mut uow = storage.begin().await.unwrap();
        let coupon = uow.insert_coupon(&new_coupon()).await.unwrap();
        let grant = CouponGrant::issue(UserId::new(1), &coupon, Utc::now());
        uow.insert_grant(&grant).await.unwrap();

        let again = uow.insert_grant(&grant).await;
        assert!(matches!(again, Err(StoreError::UniqueViolation { .. })));
    }

    #[tokio::test]
    async fn row_lock_blocks_second_reader_until_commit() {
        let storage = InMemoryStorage::new();
        let mut setup = storage.begin().await.unwrap();
        let coupon = setup.insert_coupon(&new_coupon()).await.unwrap();
        setup.commit().await.unwrap();

        let mut holder = storage.begin().await.unwrap();
        holder.find_coupon_for_update(coupon.id).await.unwrap();

        let waiter = {
            let storage = storage.clone();
            tokio::spawn(async move {
                let mut uow = storage.begin().await.unwrap();
                uow.find_coupon_for_update(coupon.id).await.unwrap().unwrap()
            })
        };

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        let current = holder.find_coupon(coupon.id).await.unwrap().unwrap();
        holder
            .save_coupon(&current.decrease_quantity(Utc::now()).unwrap())
            .await
            .unwrap();
        holder.commit().await.unwrap();

        let seen = waiter.await.unwrap();
        assert_eq!(seen.available_quantity, 2);
    }

    #[tokio::test]
    async fn stock_is_compare_and_decrement() {
        let storage = InMemoryStorage::new();
        let mut uow = storage.begin().await.unwrap();
        let product = uow.insert_product(&Product::new("Mug", Money::new(5_000), 2)).await.unwrap();

        assert!(uow.decrement_stock(product.id, 2).await.unwrap());
        assert!(!uow.decrement_stock(product.id, 1).await.unwrap());
        uow.commit().await.unwrap();

        assert_eq!(storage.product(product.id).unwrap().stock, 0);
    }
}
