use shared::{DurableOrderStore, ReservationStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::service::OrderService;
use crate::worker::{Persister, WorkerPool, WorkerStats, DEFAULT_COMMIT_TIMEOUT, DEFAULT_WORKER_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub commit_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }
}

/// Intake service, admission queue and persistence workers, wired together.
pub struct Pipeline {
    service: Arc<OrderService>,
    workers: WorkerPool,
}

impl Pipeline {
    pub fn start(
        reservations: Arc<dyn ReservationStore>,
        durable: Arc<dyn DurableOrderStore>,
        config: PipelineConfig,
    ) -> Self {
        let (service, receiver) = OrderService::new(reservations.clone(), config.queue_capacity);
        let persister = Persister::new(durable, reservations, config.commit_timeout);
        let workers = WorkerPool::spawn(config.worker_count, receiver, persister);

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            commit_timeout_ms = config.commit_timeout.as_millis() as u64,
            "Reservation pipeline started"
        );

        Self {
            service: Arc::new(service),
            workers,
        }
    }

    pub fn service(&self) -> Arc<OrderService> {
        self.service.clone()
    }

    /// Closes admission and waits until every queued order has been committed
    /// or compensated. Callers must have stopped issuing purchases.
    pub async fn shutdown(self) -> WorkerStats {
        info!(queued = self.service.queue_depth(), "Closing admission queue");
        self.service.close();
        self.workers.join().await
    }
}
