use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::PurchaseError;
use std::sync::Arc;
use uuid::Uuid;

use crate::service::OrderService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrderService>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurchaseResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

type ApiResult = (StatusCode, Json<PurchaseResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/purchase", post(purchase))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn rejected(status: StatusCode, message: &str) -> ApiResult {
    (
        status,
        Json(PurchaseResponse {
            success: false,
            message: message.to_string(),
            order_id: None,
        }),
    )
}

fn error_status(err: &PurchaseError) -> (StatusCode, &'static str) {
    match err {
        PurchaseError::InvalidQuantity(_) => (StatusCode::BAD_REQUEST, "quantity must be positive"),
        PurchaseError::DuplicateRequest => (StatusCode::CONFLICT, "duplicate request"),
        PurchaseError::InsufficientStock => (StatusCode::GONE, "sold out"),
        PurchaseError::StoreUnavailable(_) | PurchaseError::QueueClosed => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub async fn purchase(
    State(state): State<AppState>,
    body: Result<Json<PurchaseRequest>, JsonRejection>,
) -> ApiResult {
    let Ok(Json(request)) = body else {
        return rejected(StatusCode::BAD_REQUEST, "invalid request body");
    };

    if request.request_id.is_empty()
        || request.user_id.is_empty()
        || request.item_id.is_empty()
        || request.quantity <= 0
    {
        return rejected(StatusCode::BAD_REQUEST, "missing required fields");
    }

    match state
        .service
        .purchase(&request.request_id, &request.user_id, &request.item_id, request.quantity)
        .await
    {
        Ok(order_id) => (
            StatusCode::OK,
            Json(PurchaseResponse {
                success: true,
                message: "order placed successfully".to_string(),
                order_id: Some(order_id),
            }),
        ),
        Err(e) => {
            if e.is_internal() {
                tracing::error!(request_id = %request.request_id, error = %e, "Purchase failed");
            }
            let (status, message) = error_status(&e);
            rejected(status, message)
        }
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        queue_depth: state.service.queue_depth(),
        queue_capacity: state.service.queue_capacity(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryReservationStore;
    use crate::queue::QueueReceiver;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use shared::ReservationStore;
    use tower::ServiceExt;

    async fn app(stock: i32) -> (Router, Arc<OrderService>, QueueReceiver, Arc<MemoryReservationStore>) {
        let store = Arc::new(MemoryReservationStore::default());
        store.set_stock("item-1", stock).await.unwrap();
        let (service, receiver) = OrderService::new(store.clone(), 16);
        let service = Arc::new(service);
        let router = create_router(AppState { service: service.clone() });
        (router, service, receiver, store)
    }

    async fn post_json(router: &Router, body: &str) -> (StatusCode, PurchaseResponse) {
        let response = router
            .clone()
            .oneshot(
                Request::post("/api/purchase")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn purchase_body(request_id: &str, quantity: i32) -> String {
        serde_json::json!({
            "request_id": request_id,
            "user_id": "user-1",
            "item_id": "item-1",
            "quantity": quantity,
        })
        .to_string()
    }

    #[tokio::test]
    async fn accepted_purchase_returns_order_id() {
        let (router, _service, receiver, _store) = app(5).await;

        let (status, body) = post_json(&router, &purchase_body("req-1", 1)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.order_id, Some(receiver.recv().await.unwrap().id()));
    }

    #[tokio::test]
    async fn duplicate_maps_to_conflict() {
        let (router, _service, _receiver, _store) = app(5).await;

        post_json(&router, &purchase_body("req-1", 1)).await;
        let (status, body) = post_json(&router, &purchase_body("req-1", 1)).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.success);
        assert_eq!(body.message, "duplicate request");
    }

    #[tokio::test]
    async fn sold_out_maps_to_gone() {
        let (router, _service, _receiver, _store) = app(0).await;

        let (status, body) = post_json(&router, &purchase_body("req-1", 1)).await;

        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body.message, "sold out");
    }

    #[tokio::test]
    async fn missing_fields_and_bad_json_are_bad_requests() {
        let (router, _service, _receiver, store) = app(5).await;

        let (status, body) = post_json(&router, r#"{"request_id":"req-1","quantity":1}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "missing required fields");

        let (status, _) = post_json(&router, &purchase_body("req-2", 0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_json(&router, "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "invalid request body");

        assert_eq!(store.stock("item-1"), Some(5));
    }

    #[tokio::test]
    async fn store_outage_maps_to_internal_error() {
        let (router, _service, _receiver, store) = app(5).await;
        store.set_unavailable(true);

        let (status, body) = post_json(&router, &purchase_body("req-1", 1)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "internal error");
    }

    #[tokio::test]
    async fn closed_queue_maps_to_internal_error() {
        let (router, service, _receiver, store) = app(5).await;
        service.close();

        let (status, _) = post_json(&router, &purchase_body("req-1", 1)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.stock("item-1"), Some(5));
    }

    #[tokio::test]
    async fn health_reports_queue_depth() {
        let (router, _service, _receiver, _store) = app(5).await;
        post_json(&router, &purchase_body("req-1", 1)).await;

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(health.status, "ok");
        assert_eq!(health.queue_depth, 1);
        assert_eq!(health.queue_capacity, 16);
    }
}
