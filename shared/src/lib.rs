use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod error;
pub mod store;

pub use error::{PurchaseError, StoreError};
pub use store::{DurableOrderStore, ReservationStore};

pub const STOCK_KEY_PREFIX: &str = "stock:";
pub const IDEMPOTENCY_KEY_PREFIX: &str = "idempotency:";

pub fn stock_key(item_id: &str) -> String {
    format!("{}{}", STOCK_KEY_PREFIX, item_id)
}

pub fn idempotency_key(request_id: &str) -> String {
    format!("{}{}", IDEMPOTENCY_KEY_PREFIX, request_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOrderStatus(pub String);

impl fmt::Display for UnknownOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown order status: {}", self.0)
    }
}

impl std::error::Error for UnknownOrderStatus {}

impl FromStr for OrderStatus {
    type Err = UnknownOrderStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(UnknownOrderStatus(other.to_string())),
        }
    }
}

/// An admitted purchase. Identity and quantity are fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    id: Uuid,
    user_id: String,
    item_id: String,
    quantity: i32,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds a fresh `Pending` order with a new v4 id.
    pub fn new(user_id: &str, item_id: &str, quantity: i32) -> Result<Self, PurchaseError> {
        if quantity <= 0 {
            return Err(PurchaseError::InvalidQuantity(quantity));
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            quantity,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuilds an order read back from a store.
    pub fn restore(
        id: Uuid,
        user_id: String,
        item_id: String,
        quantity: i32,
        status: OrderStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self { id, user_id, item_id, quantity, status, created_at, updated_at }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn quantity(&self) -> i32 {
        self.quantity
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub item_id: String,
    pub quantity: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Inventory {
    pub fn new(item_id: &str, quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.to_string(),
            quantity,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
