//! Bounded hand-off between the intake service and the persistence workers.
//!
//! Producers wait while the queue is full; that wait is the only admission
//! control in the pipeline. Workers share one receiver and wait while it is
//! empty. After `close`, buffered orders are still delivered and then every
//! receiver sees end-of-stream.

use shared::Order;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// The queue was closed; the order is handed back to the caller.
#[derive(Debug, Error)]
#[error("admission queue is closed")]
pub struct QueueClosed(pub Order);

pub fn admission_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));

    let sender = QueueSender {
        inner: Mutex::new(Some(tx)),
        capacity: capacity.max(1),
        depth: depth.clone(),
    };
    let receiver = QueueReceiver {
        inner: Arc::new(tokio::sync::Mutex::new(rx)),
        depth,
    };
    (sender, receiver)
}

pub struct QueueSender {
    inner: Mutex<Option<mpsc::Sender<Order>>>,
    capacity: usize,
    depth: Arc<AtomicUsize>,
}

impl QueueSender {
    fn current(&self) -> Option<mpsc::Sender<Order>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Waits for a free slot, then enqueues `order`.
    pub async fn send(&self, order: Order) -> Result<(), QueueClosed> {
        // Sending on a clone lets `close` proceed while this call waits; the
        // channel itself closes once the last clone is gone.
        let Some(tx) = self.current() else {
            return Err(QueueClosed(order));
        };
        let Ok(permit) = tx.reserve().await else {
            return Err(QueueClosed(order));
        };
        // Counted before the order becomes visible, so a receiver never
        // decrements ahead of this increment.
        self.depth.fetch_add(1, Ordering::SeqCst);
        permit.send(order);
        Ok(())
    }

    /// Stops accepting orders. Safe to call more than once.
    pub fn close(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.current().map_or(true, |tx| tx.is_closed())
    }

    /// Orders currently buffered, including after `close` while the
    /// workers drain.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Shared consumer end. Clones compete for orders; each order goes to exactly
/// one of them.
#[derive(Clone)]
pub struct QueueReceiver {
    inner: Arc<tokio::sync::Mutex<mpsc::Receiver<Order>>>,
    depth: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Next order, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Order> {
        let order = self.inner.lock().await.recv().await;
        if order.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        order
    }
}
