//! PostgreSQL storage.
//!
//! Each unit of work is one `sqlx` transaction. Exclusive reads use
//! `SELECT ... FOR UPDATE`; versioned rows are written with
//! `UPDATE ... WHERE id = $1 AND version = $2` and a zero row count is reported
//! as [`StoreError::VersionConflict`]. Grant uniqueness is enforced by the
//! `coupon_grants_user_coupon_key` constraint.

use super::{
    CatalogRepository, CouponRepository, GrantRepository, OrderRepository, Storage, StoreError,
    StoreFuture, UnitOfWork, WalletRepository,
};
use crate::catalog::{CartItem, Product};
use crate::coupon::{Coupon, CouponGrant, CouponStatus};
use crate::order::{Order, OrderItem, OrderStatus, OutboxEvent};
use crate::types::{
    CartItemId, CouponId, GrantId, Money, OrderId, ProductId, UserId, WalletId,
};
use crate::wallet::{TransactionKind, Wallet, WalletTransaction};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;

const COUPON_COLUMNS: &str = "id, name, discount_amount, total_quantity, available_quantity, \
     status, starts_at, ends_at, version, created_at, updated_at";

const GRANT_COLUMNS: &str =
    "id, user_id, coupon_id, issued_at, expires_at, used, order_id, used_at, version";

const ORDER_COLUMNS: &str = "id, order_number, user_id, total_amount, discount_amount, \
     final_amount, status, coupon_grant_id, created_at, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return Self::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        Self::Database(e.to_string())
    }
}

/// [`Storage`] backed by a PostgreSQL pool.
#[derive(Clone, Debug)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with up to `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the pool cannot be created.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to run migrations: {e}")))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Storage for PostgresStorage {
    fn begin(&self) -> StoreFuture<'_, Box<dyn UnitOfWork>> {
        Box::pin(async move {
            let tx = self.pool.begin().await?;
            let uow: Box<dyn UnitOfWork> = Box::new(PgUnitOfWork { tx });
            Ok(uow)
        })
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Database(format!("{value} exceeds INTEGER")))
}

fn to_u32(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Database(format!("negative quantity {value}")))
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Database)
}

fn coupon_from_row(row: &PgRow) -> Result<Coupon, StoreError> {
    Ok(Coupon {
        id: CouponId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        discount: Money::new(row.try_get("discount_amount")?),
        total_quantity: to_u32(row.try_get("total_quantity")?)?,
        available_quantity: to_u32(row.try_get("available_quantity")?)?,
        status: parse::<CouponStatus>(row.try_get("status")?)?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn grant_from_row(row: &PgRow) -> Result<CouponGrant, StoreError> {
    Ok(CouponGrant {
        id: GrantId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        coupon_id: CouponId::new(row.try_get("coupon_id")?),
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        used: row.try_get("used")?,
        order_id: row.try_get::<Option<i64>, _>("order_id")?.map(OrderId::new),
        used_at: row.try_get("used_at")?,
        version: row.try_get("version")?,
    })
}

fn wallet_from_row(row: &PgRow) -> Result<Wallet, StoreError> {
    Ok(Wallet {
        id: WalletId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        balance: Money::new(row.try_get("balance")?),
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn wallet_transaction_from_row(row: &PgRow) -> Result<WalletTransaction, StoreError> {
    Ok(WalletTransaction {
        id: row.try_get("id")?,
        user_id: UserId::new(row.try_get("user_id")?),
        kind: parse::<TransactionKind>(row.try_get("kind")?)?,
        amount: Money::new(row.try_get("amount")?),
        balance_after: Money::new(row.try_get("balance_after")?),
        order_id: row.try_get::<Option<i64>, _>("order_id")?.map(OrderId::new),
        created_at: row.try_get("created_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: ProductId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        price: Money::new(row.try_get("price")?),
        stock: to_u32(row.try_get("stock")?)?,
    })
}

fn cart_item_from_row(row: &PgRow) -> Result<CartItem, StoreError> {
    Ok(CartItem {
        id: CartItemId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        quantity: to_u32(row.try_get("quantity")?)?,
    })
}

fn order_item_from_row(row: &PgRow) -> Result<OrderItem, StoreError> {
    Ok(OrderItem {
        product_id: ProductId::new(row.try_get("product_id")?),
        product_name: row.try_get("product_name")?,
        unit_price: Money::new(row.try_get("unit_price")?),
        quantity: to_u32(row.try_get("quantity")?)?,
    })
}

fn order_from_row(row: &PgRow, items: Vec<OrderItem>) -> Result<Order, StoreError> {
    Ok(Order {
        id: OrderId::new(row.try_get("id")?),
        order_number: row.try_get("order_number")?,
        user_id: UserId::new(row.try_get("user_id")?),
        total_amount: Money::new(row.try_get("total_amount")?),
        discount_amount: Money::new(row.try_get("discount_amount")?),
        final_amount: Money::new(row.try_get("final_amount")?),
        status: parse::<OrderStatus>(row.try_get("status")?)?,
        coupon_grant_id: row.try_get::<Option<i64>, _>("coupon_grant_id")?.map(GrantId::new),
        items,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        order_id: OrderId::new(row.try_get("order_id")?),
        order_status: parse::<OrderStatus>(row.try_get("order_status")?)?,
        created_at: row.try_get("created_at")?,
        published: row.try_get("published")?,
    })
}

impl PgUnitOfWork {
    async fn order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT product_id, product_name, unit_price, quantity
            FROM order_items
            WHERE order_id = $1
            ORDER BY id
            ",
        )
        .bind(order_id.get())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(order_item_from_row).collect()
    }

    async fn load_orders(&mut self, rows: Vec<PgRow>) -> Result<Vec<Order>, StoreError> {
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let id = OrderId::new(row.try_get("id")?);
            let items = self.order_items(id).await?;
            orders.push(order_from_row(&row, items)?);
        }
        Ok(orders)
    }
}

impl CouponRepository for PgUnitOfWork {
    fn find_coupon_for_update(&mut self, id: CouponId) -> StoreFuture<'_, Option<Coupon>> {
        Box::pin(async move {
            let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1 FOR UPDATE");
            let row = sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(&mut *self.tx)
                .await?;
            row.as_ref().map(coupon_from_row).transpose()
        })
    }

    fn find_coupon(&mut self, id: CouponId) -> StoreFuture<'_, Option<Coupon>> {
        Box::pin(async move {
            let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(&mut *self.tx)
                .await?;
            row.as_ref().map(coupon_from_row).transpose()
        })
    }

    fn insert_coupon(&mut self, coupon: &Coupon) -> StoreFuture<'_, Coupon> {
        let mut coupon = coupon.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO coupons
                    (name, discount_amount, total_quantity, available_quantity, status,
                     starts_at, ends_at, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                ",
            )
            .bind(&coupon.name)
            .bind(coupon.discount.amount())
            .bind(to_i32(coupon.total_quantity)?)
            .bind(to_i32(coupon.available_quantity)?)
            .bind(coupon.status.as_str())
            .bind(coupon.starts_at)
            .bind(coupon.ends_at)
            .bind(coupon.version)
            .bind(coupon.created_at)
            .bind(coupon.updated_at)
            .fetch_one(&mut *self.tx)
            .await?;
            coupon.id = CouponId::new(row.try_get("id")?);
            Ok(coupon)
        })
    }

    fn save_coupon(&mut self, coupon: &Coupon) -> StoreFuture<'_, Coupon> {
        let coupon = coupon.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE coupons
                SET name = $3,
                    discount_amount = $4,
                    total_quantity = $5,
                    available_quantity = $6,
                    status = $7,
                    starts_at = $8,
                    ends_at = $9,
                    version = $10,
                    updated_at = $11
                WHERE id = $1 AND version = $2
                ",
            )
            .bind(coupon.id.get())
            .bind(coupon.version - 1)
            .bind(&coupon.name)
            .bind(coupon.discount.amount())
            .bind(to_i32(coupon.total_quantity)?)
            .bind(to_i32(coupon.available_quantity)?)
            .bind(coupon.status.as_str())
            .bind(coupon.starts_at)
            .bind(coupon.ends_at)
            .bind(coupon.version)
            .bind(coupon.updated_at)
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::VersionConflict {
                    entity: "coupon",
                    id: coupon.id.get(),
                });
            }
            Ok(coupon)
        })
    }

    fn find_all_coupons(&mut self) -> StoreFuture<'_, Vec<Coupon>> {
        Box::pin(async move {
            let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons ORDER BY id");
            let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
            rows.iter().map(coupon_from_row).collect()
        })
    }

    fn find_issuable_coupons(&mut self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<Coupon>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COUPON_COLUMNS} FROM coupons \
                 WHERE status = $1 AND available_quantity > 0 \
                   AND starts_at <= $2 AND ends_at >= $2 \
                 ORDER BY id"
            );
            let rows = sqlx::query(&sql)
                .bind(CouponStatus::Active.as_str())
                .bind(now)
                .fetch_all(&mut *self.tx)
                .await?;
            rows.iter().map(coupon_from_row).collect()
        })
    }
}

impl GrantRepository for PgUnitOfWork {
    fn find_grant_by_user_and_coupon(
        &mut self,
        user: UserId,
        coupon: CouponId,
    ) -> StoreFuture<'_, Option<CouponGrant>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {GRANT_COLUMNS} FROM coupon_grants WHERE user_id = $1 AND coupon_id = $2"
            );
            let row = sqlx::query(&sql)
                .bind(user.get())
                .bind(coupon.get())
                .fetch_optional(&mut *self.tx)
                .await?;
            row.as_ref().map(grant_from_row).transpose()
        })
    }

    fn find_grant(&mut self, id: GrantId) -> StoreFuture<'_, Option<CouponGrant>> {
        Box::pin(async move {
            let sql = format!("SELECT {GRANT_COLUMNS} FROM coupon_grants WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(&mut *self.tx)
                .await?;
            row.as_ref().map(grant_from_row).transpose()
        })
    }

    fn find_grants_by_user(&mut self, user: UserId) -> StoreFuture<'_, Vec<CouponGrant>> {
        Box::pin(async move {
            let sql =
                format!("SELECT {GRANT_COLUMNS} FROM coupon_grants WHERE user_id = $1 ORDER BY id");
            let rows = sqlx::query(&sql)
                .bind(user.get())
                .fetch_all(&mut *self.tx)
                .await?;
            rows.iter().map(grant_from_row).collect()
        })
    }

    fn insert_grant(&mut self, grant: &CouponGrant) -> StoreFuture<'_, CouponGrant> {
        let mut grant = grant.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO coupon_grants
                    (user_id, coupon_id, issued_at, expires_at, used, order_id, used_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                ",
            )
            .bind(grant.user_id.get())
            .bind(grant.coupon_id.get())
            .bind(grant.issued_at)
            .bind(grant.expires_at)
            .bind(grant.used)
            .bind(grant.order_id.map(OrderId::get))
            .bind(grant.used_at)
            .bind(grant.version)
            .fetch_one(&mut *self.tx)
            .await?;
            grant.id = GrantId::new(row.try_get("id")?);
            Ok(grant)
        })
    }

    fn save_grant(&mut self, grant: &CouponGrant) -> StoreFuture<'_, CouponGrant> {
        let grant = grant.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE coupon_grants
                SET used = $3,
                    order_id = $4,
                    used_at = $5,
                    expires_at = $6,
                    version = $7
                WHERE id = $1 AND version = $2
                ",
            )
            .bind(grant.id.get())
            .bind(grant.version - 1)
            .bind(grant.used)
            .bind(grant.order_id.map(OrderId::get))
            .bind(grant.used_at)
            .bind(grant.expires_at)
            .bind(grant.version)
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::VersionConflict {
                    entity: "grant",
                    id: grant.id.get(),
                });
            }
            Ok(grant)
        })
    }

    fn delete_grant(&mut self, id: GrantId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM coupon_grants WHERE id = $1")
                .bind(id.get())
                .execute(&mut *self.tx)
                .await?;
            Ok(())
        })
    }
}

impl WalletRepository for PgUnitOfWork {
    fn find_wallet(&mut self, user: UserId) -> StoreFuture<'_, Option<Wallet>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, user_id, balance, version, updated_at FROM wallets WHERE user_id = $1",
            )
            .bind(user.get())
            .fetch_optional(&mut *self.tx)
            .await?;
            row.as_ref().map(wallet_from_row).transpose()
        })
    }

    fn insert_wallet(&mut self, wallet: &Wallet) -> StoreFuture<'_, Wallet> {
        let mut wallet = wallet.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO wallets (user_id, balance, version, updated_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                ",
            )
            .bind(wallet.user_id.get())
            .bind(wallet.balance.amount())
            .bind(wallet.version)
            .bind(wallet.updated_at)
            .fetch_one(&mut *self.tx)
            .await?;
            wallet.id = WalletId::new(row.try_get("id")?);
            Ok(wallet)
        })
    }

    fn save_wallet(&mut self, wallet: &Wallet) -> StoreFuture<'_, Wallet> {
        let wallet = wallet.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE wallets
                SET balance = $3,
                    version = $4,
                    updated_at = $5
                WHERE id = $1 AND version = $2
                ",
            )
            .bind(wallet.id.get())
            .bind(wallet.version - 1)
            .bind(wallet.balance.amount())
            .bind(wallet.version)
            .bind(wallet.updated_at)
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::VersionConflict {
                    entity: "wallet",
                    id: wallet.id.get(),
                });
            }
            Ok(wallet)
        })
    }

    fn append_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> StoreFuture<'_, WalletTransaction> {
        let mut entry = entry.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO wallet_transactions
                    (user_id, kind, amount, balance_after, order_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                ",
            )
            .bind(entry.user_id.get())
            .bind(entry.kind.as_str())
            .bind(entry.amount.amount())
            .bind(entry.balance_after.amount())
            .bind(entry.order_id.map(OrderId::get))
            .bind(entry.created_at)
            .fetch_one(&mut *self.tx)
            .await?;
            entry.id = row.try_get("id")?;
            Ok(entry)
        })
    }

    fn wallet_transactions(&mut self, user: UserId) -> StoreFuture<'_, Vec<WalletTransaction>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, user_id, kind, amount, balance_after, order_id, created_at
                FROM wallet_transactions
                WHERE user_id = $1
                ORDER BY id
                ",
            )
            .bind(user.get())
            .fetch_all(&mut *self.tx)
            .await?;
            rows.iter().map(wallet_transaction_from_row).collect()
        })
    }
}

impl CatalogRepository for PgUnitOfWork {
    fn cart_items(&mut self, ids: &[CartItemId]) -> StoreFuture<'_, Vec<CartItem>> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, user_id, product_id, quantity FROM cart_items WHERE id = ANY($1) ORDER BY id",
            )
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await?;
            rows.iter().map(cart_item_from_row).collect()
        })
    }

    fn products(&mut self, ids: &[ProductId]) -> StoreFuture<'_, Vec<Product>> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, name, price, stock FROM products WHERE id = ANY($1) ORDER BY id",
            )
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await?;
            rows.iter().map(product_from_row).collect()
        })
    }

    fn decrement_stock(&mut self, product: ProductId, quantity: u32) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE products SET stock = stock - $2 WHERE id = $1 AND stock >= $2",
            )
            .bind(product.get())
            .bind(to_i32(quantity)?)
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(true);
            }

            let exists = sqlx::query("SELECT 1 FROM products WHERE id = $1")
                .bind(product.get())
                .fetch_optional(&mut *self.tx)
                .await?;
            match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::RowNotFound {
                    entity: "product",
                    id: product.get(),
                }),
            }
        })
    }

    fn remove_cart_items(&mut self, user: UserId, ids: &[CartItemId]) -> StoreFuture<'_, ()> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        Box::pin(async move {
            sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND id = ANY($2)")
                .bind(user.get())
                .bind(ids)
                .execute(&mut *self.tx)
                .await?;
            Ok(())
        })
    }

    fn insert_product(&mut self, product: &Product) -> StoreFuture<'_, Product> {
        let mut product = product.clone();
        Box::pin(async move {
            let row = sqlx::query(
                "INSERT INTO products (name, price, stock) VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(&product.name)
            .bind(product.price.amount())
            .bind(to_i32(product.stock)?)
            .fetch_one(&mut *self.tx)
            .await?;
            product.id = ProductId::new(row.try_get("id")?);
            Ok(product)
        })
    }

    fn insert_cart_item(&mut self, item: &CartItem) -> StoreFuture<'_, CartItem> {
        let mut item = item.clone();
        Box::pin(async move {
            let row = sqlx::query(
                "INSERT INTO cart_items (user_id, product_id, quantity) VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(item.user_id.get())
            .bind(item.product_id.get())
            .bind(to_i32(item.quantity)?)
            .fetch_one(&mut *self.tx)
            .await?;
            item.id = CartItemId::new(row.try_get("id")?);
            Ok(item)
        })
    }
}

impl OrderRepository for PgUnitOfWork {
    fn insert_order(&mut self, order: &Order) -> StoreFuture<'_, Order> {
        let mut order = order.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO orders
                    (order_number, user_id, total_amount, discount_amount, final_amount,
                     status, coupon_grant_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING id
                ",
            )
            .bind(&order.order_number)
            .bind(order.user_id.get())
            .bind(order.total_amount.amount())
            .bind(order.discount_amount.amount())
            .bind(order.final_amount.amount())
            .bind(order.status.as_str())
            .bind(order.coupon_grant_id.map(GrantId::get))
            .bind(order.created_at)
            .bind(order.updated_at)
            .fetch_one(&mut *self.tx)
            .await?;
            order.id = OrderId::new(row.try_get("id")?);

            for item in &order.items {
                sqlx::query(
                    r"
                    INSERT INTO order_items
                        (order_id, product_id, product_name, unit_price, quantity)
                    VALUES ($1, $2, $3, $4, $5)
                    ",
                )
                .bind(order.id.get())
                .bind(item.product_id.get())
                .bind(&item.product_name)
                .bind(item.unit_price.amount())
                .bind(to_i32(item.quantity)?)
                .execute(&mut *self.tx)
                .await?;
            }
            Ok(order)
        })
    }

    fn save_order(&mut self, order: &Order) -> StoreFuture<'_, Order> {
        let order = order.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE orders
                SET status = $2,
                    coupon_grant_id = $3,
                    updated_at = $4
                WHERE id = $1
                ",
            )
            .bind(order.id.get())
            .bind(order.status.as_str())
            .bind(order.coupon_grant_id.map(GrantId::get))
            .bind(order.updated_at)
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::RowNotFound {
                    entity: "order",
                    id: order.id.get(),
                });
            }
            Ok(order)
        })
    }

    fn find_order(&mut self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(&mut *self.tx)
                .await?;
            match row {
                Some(row) => {
                    let items = self.order_items(id).await?;
                    order_from_row(&row, items).map(Some)
                }
                None => Ok(None),
            }
        })
    }

    fn find_orders_by_user(&mut self, user: UserId) -> StoreFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 \
                 ORDER BY created_at DESC, id DESC"
            );
            let rows = sqlx::query(&sql)
                .bind(user.get())
                .fetch_all(&mut *self.tx)
                .await?;
            self.load_orders(rows).await
        })
    }

    fn append_outbox(&mut self, event: &OutboxEvent) -> StoreFuture<'_, OutboxEvent> {
        let mut event = event.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO order_outbox (order_id, order_status, created_at, published)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                ",
            )
            .bind(event.order_id.get())
            .bind(event.order_status.as_str())
            .bind(event.created_at)
            .bind(event.published)
            .fetch_one(&mut *self.tx)
            .await?;
            event.id = row.try_get("id")?;
            Ok(event)
        })
    }

    fn pending_outbox(&mut self, limit: usize) -> StoreFuture<'_, Vec<OutboxEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, order_id, order_status, created_at, published
                FROM order_outbox
                WHERE NOT published
                ORDER BY id
                LIMIT $1
                ",
            )
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
            rows.iter().map(outbox_from_row).collect()
        })
    }

    fn mark_outbox_published(&mut self, id: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE order_outbox SET published = TRUE WHERE id = $1")
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::RowNotFound { entity: "outbox", id });
            }
            Ok(())
        })
    }
}

impl UnitOfWork for PgUnitOfWork {
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        let Self { tx } = *self;
        Box::pin(async move {
            tx.commit().await?;
            Ok(())
        })
    }
}
