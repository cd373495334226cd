use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{Inventory, Order, OrderStatus, StoreError};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub item_id: String,
    pub user_id: String,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct InventoryRow {
    pub item_id: String,
    pub stock: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderRow {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id(),
            item_id: order.item_id().to_string(),
            user_id: order.user_id().to_string(),
            quantity: order.quantity(),
            status: order.status().as_str().to_string(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status: OrderStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Unavailable(format!("order {}: {}", row.id, e)))?;

        Ok(Order::restore(
            row.id,
            row.user_id,
            row.item_id,
            row.quantity,
            status,
            row.created_at,
            row.updated_at,
        ))
    }
}

impl From<InventoryRow> for Inventory {
    fn from(row: InventoryRow) -> Self {
        Self {
            item_id: row.item_id,
            quantity: row.stock,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
