use shared::{idempotency_key, Order, PurchaseError, ReservationStore};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::queue::{admission_queue, QueueClosed, QueueReceiver, QueueSender};

/// Stock taken from the reservation store but not yet handed to the queue.
///
/// Dropping it while still held gives the stock back, so a caller that
/// abandons `purchase` mid-way never leaves a reservation with no order.
struct HeldReservation {
    store: Arc<dyn ReservationStore>,
    item_id: String,
    quantity: i32,
    held: bool,
}

impl HeldReservation {
    fn new(store: Arc<dyn ReservationStore>, item_id: &str, quantity: i32) -> Self {
        Self {
            store,
            item_id: item_id.to_string(),
            quantity,
            held: true,
        }
    }

    /// The order now owns the stock.
    fn hand_off(mut self) {
        self.held = false;
    }

    async fn release(mut self) {
        self.held = false;
        if let Err(e) = self.store.increment_stock(&self.item_id, self.quantity).await {
            error!(
                critical = true,
                item_id = %self.item_id,
                quantity = self.quantity,
                error = %e,
                "Failed to release reservation; reservation store is now short"
            );
        }
    }
}

impl Drop for HeldReservation {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let store = self.store.clone();
        let item_id = std::mem::take(&mut self.item_id);
        let quantity = self.quantity;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(%item_id, quantity, "Purchase abandoned after reservation; releasing stock");
                handle.spawn(async move {
                    if let Err(e) = store.increment_stock(&item_id, quantity).await {
                        error!(
                            critical = true,
                            %item_id,
                            quantity,
                            error = %e,
                            "Failed to release abandoned reservation; reservation store is now short"
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    critical = true,
                    %item_id,
                    quantity,
                    "Reservation abandoned outside a runtime; stock not released"
                );
            }
        }
    }
}

/// Admits purchase requests: idempotency check, atomic reservation, then
/// hand-off to the admission queue.
pub struct OrderService {
    reservations: Arc<dyn ReservationStore>,
    queue: QueueSender,
}

impl OrderService {
    pub fn new(reservations: Arc<dyn ReservationStore>, queue_capacity: usize) -> (Self, QueueReceiver) {
        let (queue, receiver) = admission_queue(queue_capacity);
        (Self { reservations, queue }, receiver)
    }

    /// Admits one purchase and returns the id of the queued order.
    ///
    /// The idempotency marker is written first and is kept even when the
    /// reservation then fails, so a request id that hit `InsufficientStock`
    /// stays a `DuplicateRequest` until the marker expires. Waits while the
    /// admission queue is full.
    pub async fn purchase(
        &self,
        request_id: &str,
        user_id: &str,
        item_id: &str,
        quantity: i32,
    ) -> Result<Uuid, PurchaseError> {
        if quantity <= 0 {
            return Err(PurchaseError::InvalidQuantity(quantity));
        }

        if !self.reservations.set_idempotency(&idempotency_key(request_id)).await? {
            debug!(request_id, "Duplicate purchase request");
            return Err(PurchaseError::DuplicateRequest);
        }

        if !self.reservations.decrement_stock(item_id, quantity).await? {
            debug!(request_id, item_id, quantity, "Insufficient stock");
            return Err(PurchaseError::InsufficientStock);
        }
        let reservation = HeldReservation::new(self.reservations.clone(), item_id, quantity);

        let order = Order::new(user_id, item_id, quantity)?;
        let order_id = order.id();

        match self.queue.send(order).await {
            Ok(()) => {
                reservation.hand_off();
                debug!(request_id, %order_id, item_id, quantity, "Order admitted");
                Ok(order_id)
            }
            Err(QueueClosed(order)) => {
                warn!(request_id, order_id = %order.id(), "Admission queue closed; releasing reservation");
                reservation.release().await;
                Err(PurchaseError::QueueClosed)
            }
        }
    }

    /// Stops admitting orders. Buffered orders are still delivered to the
    /// workers, which stop once the queue is empty.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryReservationStore;
    use shared::OrderStatus;
    use std::time::Duration;

    async fn service_with_stock(stock: i32, capacity: usize) -> (OrderService, QueueReceiver, Arc<MemoryReservationStore>) {
        let store = Arc::new(MemoryReservationStore::default());
        store.set_stock("item-1", stock).await.unwrap();
        let (service, receiver) = OrderService::new(store.clone(), capacity);
        (service, receiver, store)
    }

    #[tokio::test]
    async fn purchase_reserves_stock_and_queues_pending_order() {
        let (service, receiver, store) = service_with_stock(10, 100).await;

        let order_id = service.purchase("req-1", "user-1", "item-1", 2).await.unwrap();

        assert_eq!(store.stock("item-1"), Some(8));
        let order = receiver.recv().await.unwrap();
        assert_eq!(order.id(), order_id);
        assert_eq!(order.user_id(), "user-1");
        assert_eq!(order.item_id(), "item-1");
        assert_eq!(order.quantity(), 2);
        assert_eq!(order.status(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn insufficient_stock_leaves_counter_untouched() {
        let (service, _receiver, store) = service_with_stock(1, 100).await;

        assert_eq!(
            service.purchase("req-1", "user", "item-1", 2).await,
            Err(PurchaseError::InsufficientStock)
        );
        assert_eq!(store.stock("item-1"), Some(1));
    }

    #[tokio::test]
    async fn unknown_item_is_insufficient_stock() {
        let (service, _receiver, _store) = service_with_stock(10, 100).await;

        assert_eq!(
            service.purchase("req-1", "user", "other-item", 1).await,
            Err(PurchaseError::InsufficientStock)
        );
    }

    #[tokio::test]
    async fn duplicate_request_is_rejected_without_side_effects() {
        let (service, _receiver, store) = service_with_stock(10, 100).await;

        service.purchase("req-1", "user", "item-1", 1).await.unwrap();
        assert_eq!(
            service.purchase("req-1", "user", "item-1", 1).await,
            Err(PurchaseError::DuplicateRequest)
        );
        assert_eq!(store.stock("item-1"), Some(9));
    }

    #[tokio::test]
    async fn failed_reservation_still_consumes_request_id() {
        let (service, _receiver, store) = service_with_stock(0, 100).await;

        assert_eq!(
            service.purchase("req-1", "user", "item-1", 1).await,
            Err(PurchaseError::InsufficientStock)
        );
        store.set_stock("item-1", 5).await.unwrap();
        assert_eq!(
            service.purchase("req-1", "user", "item-1", 1).await,
            Err(PurchaseError::DuplicateRequest)
        );
        assert_eq!(store.stock("item-1"), Some(5));
    }

    #[tokio::test]
    async fn invalid_quantity_has_no_side_effects() {
        let (service, _receiver, store) = service_with_stock(10, 100).await;

        assert_eq!(
            service.purchase("req-1", "user", "item-1", 0).await,
            Err(PurchaseError::InvalidQuantity(0))
        );
        // The request id was not consumed.
        service.purchase("req-1", "user", "item-1", 1).await.unwrap();
        assert_eq!(store.stock("item-1"), Some(9));
    }

    #[tokio::test]
    async fn store_outage_is_reported_as_unavailable() {
        let (service, _receiver, store) = service_with_stock(10, 100).await;
        store.set_unavailable(true);

        let err = service.purchase("req-1", "user", "item-1", 1).await.unwrap_err();
        assert!(matches!(err, PurchaseError::StoreUnavailable(_)));
        assert!(err.is_internal());

        store.set_unavailable(false);
        assert_eq!(store.stock("item-1"), Some(10));
    }

    #[tokio::test]
    async fn purchase_after_close_releases_reservation() {
        let (service, receiver, store) = service_with_stock(10, 100).await;
        service.close();

        assert_eq!(
            service.purchase("req-1", "user", "item-1", 3).await,
            Err(PurchaseError::QueueClosed)
        );
        assert_eq!(store.stock("item-1"), Some(10));
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn abandoned_purchase_releases_reservation() {
        let (service, _receiver, store) = service_with_stock(10, 1).await;
        service.purchase("req-1", "user", "item-1", 1).await.unwrap();

        // Queue is full, so this purchase reserves stock and then waits.
        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            service.purchase("req-2", "user", "item-1", 4),
        )
        .await;
        assert!(waiting.is_err());

        // The timed-out future was dropped; the release runs on a spawned task.
        for _ in 0..50 {
            if store.stock("item-1") == Some(9) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.stock("item-1"), Some(9));
    }
}
