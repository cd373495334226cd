//! In-process implementations of both capability sets.
//!
//! Every operation runs inside one mutex critical section, which gives the same
//! per-key atomicity the Redis script and the SQL transaction provide. Fault
//! injection switches let tests drive the failure paths of the pipeline.

use async_trait::async_trait;
use chrono::Utc;
use shared::{DurableOrderStore, Inventory, Order, ReservationStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain maps in a usable state.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(operation: &str) -> StoreError {
    StoreError::Unavailable(format!("{} failed: injected fault", operation))
}

#[derive(Debug, Default)]
struct ReservationState {
    stock: HashMap<String, i64>,
    idempotency: HashMap<String, Instant>,
    next_sweep: Option<Instant>,
}

impl ReservationState {
    /// Drops expired idempotency markers, at most once per `ttl`, so the map
    /// stays bounded by the keys written within roughly two TTLs.
    fn sweep_expired(&mut self, now: Instant, ttl: Duration) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.idempotency.retain(|_, expires_at| *expires_at > now);
        self.next_sweep = Some(now + ttl);
    }
}

#[derive(Debug)]
pub struct MemoryReservationStore {
    state: Mutex<ReservationState>,
    idempotency_ttl: Duration,
    unavailable: AtomicBool,
    fail_increments: AtomicBool,
}

impl MemoryReservationStore {
    pub fn new(idempotency_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(ReservationState::default()),
            idempotency_ttl,
            unavailable: AtomicBool::new(false),
            fail_increments: AtomicBool::new(false),
        }
    }

    /// Current counter for `item_id`, `None` when it was never set.
    pub fn stock(&self, item_id: &str) -> Option<i64> {
        lock(&self.state).stock.get(item_id).copied()
    }

    /// Makes every operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes only compensating increments fail.
    pub fn set_fail_increments(&self, fail: bool) {
        self.fail_increments.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(injected(operation));
        }
        Ok(())
    }
}

impl Default for MemoryReservationStore {
    fn default() -> Self {
        Self::new(crate::reservation::DEFAULT_IDEMPOTENCY_TTL)
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn decrement_stock(&self, item_id: &str, quantity: i32) -> Result<bool, StoreError> {
        self.check_available("decrement stock")?;
        let mut state = lock(&self.state);

        match state.stock.get_mut(item_id) {
            Some(current) if *current >= i64::from(quantity) => {
                *current -= i64::from(quantity);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_stock(&self, item_id: &str, quantity: i32) -> Result<(), StoreError> {
        self.check_available("increment stock")?;
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(injected("increment stock"));
        }

        let mut state = lock(&self.state);
        *state.stock.entry(item_id.to_string()).or_insert(0) += i64::from(quantity);
        Ok(())
    }

    async fn set_idempotency(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available("set idempotency key")?;
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.sweep_expired(now, self.idempotency_ttl);

        match state.idempotency.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                state.idempotency.insert(key.to_string(), now + self.idempotency_ttl);
                Ok(true)
            }
        }
    }

    async fn set_stock(&self, item_id: &str, quantity: i32) -> Result<(), StoreError> {
        self.check_available("set stock")?;
        lock(&self.state).stock.insert(item_id.to_string(), i64::from(quantity));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DurableState {
    orders: HashMap<Uuid, Order>,
    inventory: HashMap<String, Inventory>,
}

#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    state: Mutex<DurableState>,
    commit_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same semantics as the PostgreSQL upsert: a new row starts at version
    /// 0, an existing one gets its stock overwritten and its version bumped.
    pub fn seed_inventory(&self, item_id: &str, stock: i32) -> Result<(), StoreError> {
        if stock < 0 {
            return Err(StoreError::InvalidStock(stock));
        }

        let mut state = lock(&self.state);
        match state.inventory.get_mut(item_id) {
            Some(existing) => {
                existing.quantity = stock;
                existing.version += 1;
                existing.updated_at = Utc::now();
            }
            None => {
                state.inventory.insert(item_id.to_string(), Inventory::new(item_id, stock));
            }
        }
        Ok(())
    }

    pub fn find_order(&self, order_id: Uuid) -> Option<Order> {
        lock(&self.state).orders.get(&order_id).cloned()
    }

    pub fn count_orders(&self, item_id: &str) -> usize {
        lock(&self.state)
            .orders
            .values()
            .filter(|order| order.item_id() == item_id)
            .count()
    }

    /// Delays every `create_order` before it touches state, to exercise
    /// commit timeouts.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *lock(&self.commit_delay) = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(injected(operation));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableOrderStore for MemoryOrderStore {
    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        let delay = *lock(&self.commit_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available("create order")?;

        let mut state = lock(&self.state);
        if state.orders.contains_key(&order.id()) {
            return Err(StoreError::Unavailable(format!("duplicate order id {}", order.id())));
        }

        let inventory = match state.inventory.get_mut(order.item_id()) {
            Some(inv) if inv.quantity >= order.quantity() => inv,
            _ => return Err(StoreError::OptimisticLockConflict),
        };
        inventory.quantity -= order.quantity();
        inventory.version += 1;
        inventory.updated_at = Utc::now();

        state.orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn get_inventory(&self, item_id: &str) -> Result<Option<Inventory>, StoreError> {
        self.check_available("get inventory")?;
        Ok(lock(&self.state).inventory.get(item_id).cloned())
    }

    async fn update_inventory(&self, inv: &Inventory) -> Result<(), StoreError> {
        if inv.quantity < 0 {
            return Err(StoreError::InvalidStock(inv.quantity));
        }
        self.check_available("update inventory")?;

        let mut state = lock(&self.state);
        match state.inventory.get_mut(&inv.item_id) {
            Some(stored) if stored.version == inv.version => {
                stored.quantity = inv.quantity;
                stored.version += 1;
                stored.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::OptimisticLockConflict),
        }
    }
}
