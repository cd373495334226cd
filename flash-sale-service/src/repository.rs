use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::PgConnection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, PoolError};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::{DurableOrderStore, Inventory, Order, StoreError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<AsyncPgConnection>;

pub fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    Ok(())
}

pub async fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().max_size(max_size).build(config).await?;
    Ok(pool)
}

fn pool_unavailable(e: bb8::RunError<PoolError>) -> StoreError {
    StoreError::Unavailable(format!("acquire connection: {}", e))
}

fn query_failed(e: diesel::result::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Error type of the `create_order` transaction; any `Err` rolls it back.
#[derive(Debug)]
enum CommitFailure {
    Query(diesel::result::Error),
    StockGuard,
}

impl From<diesel::result::Error> for CommitFailure {
    fn from(e: diesel::result::Error) -> Self {
        CommitFailure::Query(e)
    }
}

impl From<CommitFailure> for StoreError {
    fn from(e: CommitFailure) -> Self {
        match e {
            CommitFailure::Query(e) => query_failed(e),
            CommitFailure::StockGuard => StoreError::OptimisticLockConflict,
        }
    }
}

/// PostgreSQL-backed order and inventory store.
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: DbPool,
}

impl PgOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool.get().await.map_err(pool_unavailable)
    }

    /// Inserts the inventory row, or overwrites its stock and bumps the
    /// version when it already exists.
    pub async fn seed_inventory(&self, item_id: &str, stock: i32) -> Result<(), StoreError> {
        if stock < 0 {
            return Err(StoreError::InvalidStock(stock));
        }

        let mut conn = self.conn().await?;
        let now = Utc::now();
        let row = InventoryRow {
            item_id: item_id.to_string(),
            stock,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        diesel::insert_into(inventory::table)
            .values(&row)
            .on_conflict(inventory::item_id)
            .do_update()
            .set((
                inventory::stock.eq(excluded(inventory::stock)),
                inventory::version.eq(inventory::version + 1),
                inventory::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map_err(query_failed)?;

        info!(item_id, stock, "Seeded durable inventory");
        Ok(())
    }

    pub async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let mut conn = self.conn().await?;

        let row = orders::table
            .find(order_id)
            .first::<OrderRow>(&mut conn)
            .await
            .optional()
            .map_err(query_failed)?;

        row.map(Order::try_from).transpose()
    }

    pub async fn count_orders(&self, item_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;

        let count = orders::table
            .filter(orders::item_id.eq(item_id))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(query_failed)?;

        Ok(count)
    }
}

#[async_trait]
impl DurableOrderStore for PgOrderRepository {
    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let row = OrderRow::from(order);

        conn.transaction::<_, CommitFailure, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&row)
                    .execute(conn)
                    .await?;

                let updated = diesel::update(
                    inventory::table
                        .filter(inventory::item_id.eq(&row.item_id))
                        .filter(inventory::stock.ge(row.quantity)),
                )
                .set((
                    inventory::stock.eq(inventory::stock - row.quantity),
                    inventory::version.eq(inventory::version + 1),
                    inventory::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

                // Returning an error here rolls back the order insert as well.
                if updated == 0 {
                    return Err(CommitFailure::StockGuard);
                }

                Ok(())
            })
        })
        .await?;

        debug!(order_id = %order.id(), item_id = order.item_id(), "Order committed");
        Ok(())
    }

    async fn get_inventory(&self, item_id: &str) -> Result<Option<Inventory>, StoreError> {
        let mut conn = self.conn().await?;

        let row = inventory::table
            .find(item_id)
            .first::<InventoryRow>(&mut conn)
            .await
            .optional()
            .map_err(query_failed)?;

        Ok(row.map(Inventory::from))
    }

    async fn update_inventory(&self, inv: &Inventory) -> Result<(), StoreError> {
        if inv.quantity < 0 {
            return Err(StoreError::InvalidStock(inv.quantity));
        }

        let mut conn = self.conn().await?;

        let updated = diesel::update(
            inventory::table
                .filter(inventory::item_id.eq(&inv.item_id))
                .filter(inventory::version.eq(inv.version)),
        )
        .set((
            inventory::stock.eq(inv.quantity),
            inventory::version.eq(inventory::version + 1),
            inventory::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(query_failed)?;

        if updated == 0 {
            return Err(StoreError::OptimisticLockConflict);
        }

        Ok(())
    }
}
