use shared::{DurableOrderStore, Order, ReservationStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::QueueReceiver;

pub const DEFAULT_WORKER_COUNT: usize = 10;
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("commit timed out after {0:?}")]
    Timeout(Duration),
}

/// The compensating increment failed: the reservation store is now short by
/// `quantity` relative to the durable store and nothing will repair it.
#[derive(Debug, Error)]
#[error("compensation failed for order {order_id} ({quantity} x {item_id}): {cause}")]
pub struct CompensationFailure {
    pub order_id: Uuid,
    pub item_id: String,
    pub quantity: i32,
    pub commit: CommitError,
    pub cause: CommitError,
}

#[derive(Debug)]
pub enum Outcome {
    Persisted,
    Compensated(CommitError),
    CompensationFailed(CompensationFailure),
}

#[derive(Debug, Default)]
struct Counters {
    persisted: AtomicU64,
    compensated: AtomicU64,
    compensation_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub persisted: u64,
    pub compensated: u64,
    pub compensation_failures: u64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.persisted + self.compensated + self.compensation_failures
    }
}

/// Commits one order at a time and compensates the reservation store when
/// the commit fails. Orders are never retried or re-queued.
#[derive(Clone)]
pub struct Persister {
    durable: Arc<dyn DurableOrderStore>,
    reservations: Arc<dyn ReservationStore>,
    commit_timeout: Duration,
}

impl Persister {
    pub fn new(
        durable: Arc<dyn DurableOrderStore>,
        reservations: Arc<dyn ReservationStore>,
        commit_timeout: Duration,
    ) -> Self {
        Self { durable, reservations, commit_timeout }
    }

    pub async fn process(&self, order: &Order) -> Outcome {
        let commit = match time::timeout(self.commit_timeout, self.durable.create_order(order)).await {
            Ok(Ok(())) => return Outcome::Persisted,
            Ok(Err(e)) => CommitError::Store(e),
            Err(_) => CommitError::Timeout(self.commit_timeout),
        };

        let restore = self.reservations.increment_stock(order.item_id(), order.quantity());
        match time::timeout(self.commit_timeout, restore).await {
            Ok(Ok(())) => Outcome::Compensated(commit),
            Ok(Err(e)) => Outcome::CompensationFailed(self.failure(order, commit, CommitError::Store(e))),
            Err(_) => Outcome::CompensationFailed(
                self.failure(order, commit, CommitError::Timeout(self.commit_timeout)),
            ),
        }
    }

    fn failure(&self, order: &Order, commit: CommitError, cause: CommitError) -> CompensationFailure {
        CompensationFailure {
            order_id: order.id(),
            item_id: order.item_id().to_string(),
            quantity: order.quantity(),
            commit,
            cause,
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawns `worker_count` tasks that drain `receiver` until it is closed
    /// and empty.
    pub fn spawn(worker_count: usize, receiver: QueueReceiver, persister: Persister) -> Self {
        let counters = Arc::new(Counters::default());

        let handles = (0..worker_count.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let persister = persister.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    run_worker(id, receiver, persister, counters).await;
                })
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Started persistence workers");
        Self { handles, counters }
    }

    /// Waits for every worker to finish. Workers only finish once the queue
    /// has been closed and fully drained.
    pub async fn join(self) -> WorkerStats {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Persistence worker terminated abnormally");
            }
        }

        let stats = self.counters.snapshot();
        info!(
            persisted = stats.persisted,
            compensated = stats.compensated,
            compensation_failures = stats.compensation_failures,
            "Persistence workers stopped"
        );
        stats
    }
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            persisted: self.persisted.load(Ordering::SeqCst),
            compensated: self.compensated.load(Ordering::SeqCst),
            compensation_failures: self.compensation_failures.load(Ordering::SeqCst),
        }
    }
}

async fn run_worker(id: usize, receiver: QueueReceiver, persister: Persister, counters: Arc<Counters>) {
    while let Some(order) = receiver.recv().await {
        match persister.process(&order).await {
            Outcome::Persisted => {
                counters.persisted.fetch_add(1, Ordering::SeqCst);
                debug!(worker = id, order_id = %order.id(), "Saved order");
            }
            Outcome::Compensated(e) => {
                counters.compensated.fetch_add(1, Ordering::SeqCst);
                warn!(
                    worker = id,
                    order_id = %order.id(),
                    item_id = order.item_id(),
                    quantity = order.quantity(),
                    error = %e,
                    "Failed to save order; restored reserved stock"
                );
            }
            Outcome::CompensationFailed(failure) => {
                counters.compensation_failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    critical = true,
                    worker = id,
                    order_id = %failure.order_id,
                    item_id = %failure.item_id,
                    quantity = failure.quantity,
                    commit_error = %failure.commit,
                    error = %failure.cause,
                    "CRITICAL: failed to restore reserved stock; reservation and durable stores diverged"
                );
            }
        }
    }

    debug!(worker = id, "Admission queue drained; worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryOrderStore, MemoryReservationStore};
    use crate::queue::admission_queue;

    async fn stores(stock: i32) -> (Arc<MemoryReservationStore>, Arc<MemoryOrderStore>) {
        let reservations = Arc::new(MemoryReservationStore::default());
        reservations.set_stock("item", stock).await.unwrap();
        let durable = Arc::new(MemoryOrderStore::new());
        durable.seed_inventory("item", stock).unwrap();
        (reservations, durable)
    }

    fn persister(
        durable: &Arc<MemoryOrderStore>,
        reservations: &Arc<MemoryReservationStore>,
        timeout: Duration,
    ) -> Persister {
        Persister::new(durable.clone(), reservations.clone(), timeout)
    }

    #[tokio::test]
    async fn successful_commit_is_persisted() {
        let (reservations, durable) = stores(5).await;
        let persister = persister(&durable, &reservations, DEFAULT_COMMIT_TIMEOUT);
        assert!(reservations.decrement_stock("item", 1).await.unwrap());
        let order = Order::new("user", "item", 1).unwrap();

        assert!(matches!(persister.process(&order).await, Outcome::Persisted));
        assert!(durable.find_order(order.id()).is_some());
        assert_eq!(reservations.stock("item"), Some(4));
    }

    #[tokio::test]
    async fn failed_commit_restores_reserved_stock() {
        let (reservations, durable) = stores(5).await;
        // Counter ahead of the durable row: an order for 6 reserves but cannot commit.
        reservations.set_stock("item", 10).await.unwrap();
        let persister = persister(&durable, &reservations, DEFAULT_COMMIT_TIMEOUT);
        assert!(reservations.decrement_stock("item", 6).await.unwrap());
        let order = Order::new("user", "item", 6).unwrap();

        let outcome = persister.process(&order).await;

        assert!(matches!(
            outcome,
            Outcome::Compensated(CommitError::Store(StoreError::OptimisticLockConflict))
        ));
        assert_eq!(reservations.stock("item"), Some(10));
        assert!(durable.find_order(order.id()).is_none());
    }

    #[tokio::test]
    async fn commit_timeout_triggers_compensation() {
        let (reservations, durable) = stores(5).await;
        durable.set_commit_delay(Some(Duration::from_millis(200)));
        let persister = persister(&durable, &reservations, Duration::from_millis(20));
        assert!(reservations.decrement_stock("item", 2).await.unwrap());
        let order = Order::new("user", "item", 2).unwrap();

        let outcome = persister.process(&order).await;

        assert!(matches!(outcome, Outcome::Compensated(CommitError::Timeout(_))));
        assert_eq!(reservations.stock("item"), Some(5));
        assert!(durable.find_order(order.id()).is_none());
    }

    #[tokio::test]
    async fn failed_compensation_is_reported() {
        let (reservations, durable) = stores(5).await;
        durable.set_unavailable(true);
        reservations.set_fail_increments(true);
        let persister = persister(&durable, &reservations, DEFAULT_COMMIT_TIMEOUT);
        assert!(reservations.decrement_stock("item", 1).await.unwrap());
        let order = Order::new("user", "item", 1).unwrap();

        match persister.process(&order).await {
            Outcome::CompensationFailed(failure) => {
                assert_eq!(failure.order_id, order.id());
                assert_eq!(failure.quantity, 1);
                assert!(matches!(failure.commit, CommitError::Store(StoreError::Unavailable(_))));
            }
            other => panic!("expected compensation failure, got {:?}", other),
        }
        assert_eq!(reservations.stock("item"), Some(4));
    }

    #[tokio::test]
    async fn pool_drains_queue_before_stopping() {
        let (reservations, durable) = stores(10).await;
        let (tx, rx) = admission_queue(16);
        for _ in 0..10 {
            assert!(reservations.decrement_stock("item", 1).await.unwrap());
            tx.send(Order::new("user", "item", 1).unwrap()).await.unwrap();
        }

        let pool = WorkerPool::spawn(3, rx, persister(&durable, &reservations, DEFAULT_COMMIT_TIMEOUT));
        tx.close();
        let stats = pool.join().await;

        assert_eq!(stats, WorkerStats { persisted: 10, compensated: 0, compensation_failures: 0 });
        assert_eq!(durable.count_orders("item"), 10);
        let inv = durable.get_inventory("item").await.unwrap().unwrap();
        assert_eq!((inv.quantity, inv.version), (0, 10));
    }

    #[tokio::test]
    async fn pool_counts_each_outcome() {
        let (reservations, durable) = stores(1).await;
        reservations.set_stock("item", 3).await.unwrap();
        let (tx, rx) = admission_queue(16);
        for _ in 0..3 {
            assert!(reservations.decrement_stock("item", 1).await.unwrap());
            tx.send(Order::new("user", "item", 1).unwrap()).await.unwrap();
        }

        let pool = WorkerPool::spawn(1, rx, persister(&durable, &reservations, DEFAULT_COMMIT_TIMEOUT));
        tx.close();
        let stats = pool.join().await;

        // One order fits the durable stock, the other two conflict and are compensated.
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.compensated, 2);
        assert_eq!(stats.processed(), 3);
        assert_eq!(reservations.stock("item"), Some(2));
    }
}
