//! Capability sets the pipeline consumes. Backing stores are swapped by
//! providing another implementation; the intake service and workers only see
//! these traits.

use async_trait::async_trait;

use crate::{Inventory, Order, StoreError};

/// Fast volatile store holding per-item stock counters and idempotency markers.
///
/// The stock counter is never exposed for raw reads or writes: it changes only
/// through the guarded decrement and the compensating increment.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomically subtracts `quantity` if at least that much remains.
    /// Returns `false` without touching the counter otherwise, including when
    /// the item has no counter at all.
    async fn decrement_stock(&self, item_id: &str, quantity: i32) -> Result<bool, StoreError>;

    /// Unconditionally adds `quantity` back. Used only for compensation.
    async fn increment_stock(&self, item_id: &str, quantity: i32) -> Result<(), StoreError>;

    /// Creates `key` with the store's expiry if absent. Returns whether this
    /// call created it.
    async fn set_idempotency(&self, key: &str) -> Result<bool, StoreError>;

    /// Overwrites the counter. Bootstrap and tests only.
    async fn set_stock(&self, item_id: &str, quantity: i32) -> Result<(), StoreError>;
}

/// Transactional store of authoritative orders and versioned inventory.
#[async_trait]
pub trait DurableOrderStore: Send + Sync {
    /// Inserts the order and deducts its quantity from inventory in one
    /// transaction. Fails with `OptimisticLockConflict`, persisting nothing,
    /// when the inventory row is missing or holds less than the quantity.
    async fn create_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_inventory(&self, item_id: &str) -> Result<Option<Inventory>, StoreError>;

    /// Writes `inventory.quantity` if the stored version still equals
    /// `inventory.version`, bumping the version by one.
    async fn update_inventory(&self, inventory: &Inventory) -> Result<(), StoreError>;
}
