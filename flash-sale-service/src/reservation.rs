//! Redis-backed reservation store.
//!
//! Stock counters live at `stock:<item_id>`. The conditional decrement runs as
//! a Lua script so the read, compare and write happen inside Redis with no
//! other command interleaved on the same key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use shared::{stock_key, ReservationStore, StoreError};
use std::time::Duration;

/// Returns 1 when the decrement was applied, 0 when the key is missing or
/// holds less than requested.
const DECREMENT_STOCK_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end

local quantity = tonumber(ARGV[1])
if tonumber(current) >= quantity then
    redis.call('DECRBY', KEYS[1], quantity)
    return 1
end

return 0
"#;

pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn unavailable(context: &str, e: RedisError) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", context, e))
}

#[derive(Clone)]
pub struct RedisReservationStore {
    conn_manager: ConnectionManager,
    decrement_script: Script,
    idempotency_ttl: Duration,
}

impl RedisReservationStore {
    pub async fn connect(redis_url: &str, idempotency_ttl: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| unavailable("open redis client", e))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| unavailable("connect to redis", e))?;

        Ok(Self::from_manager(conn_manager, idempotency_ttl))
    }

    pub fn from_manager(conn_manager: ConnectionManager, idempotency_ttl: Duration) -> Self {
        Self {
            conn_manager,
            decrement_script: Script::new(DECREMENT_STOCK_SCRIPT),
            idempotency_ttl,
        }
    }
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn decrement_stock(&self, item_id: &str, quantity: i32) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();

        let applied: i32 = self
            .decrement_script
            .key(stock_key(item_id))
            .arg(quantity)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("decrement stock", e))?;

        Ok(applied == 1)
    }

    async fn increment_stock(&self, item_id: &str, quantity: i32) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();

        let _: i64 = conn
            .incr(stock_key(item_id), quantity)
            .await
            .map_err(|e| unavailable("increment stock", e))?;

        Ok(())
    }

    async fn set_idempotency(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();

        // SET NX replies OK when it wrote the key and nil when the key existed.
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.idempotency_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("set idempotency key", e))?;

        Ok(created.is_some())
    }

    async fn set_stock(&self, item_id: &str, quantity: i32) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();

        let _: () = conn
            .set(stock_key(item_id), quantity)
            .await
            .map_err(|e| unavailable("set stock", e))?;

        Ok(())
    }
}
