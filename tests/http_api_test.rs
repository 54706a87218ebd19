//! HTTP surface tests driving the assembled router with in-process
//! requests.

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use common::TestApp;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use terracotta_api::AppState;

async fn router_for(app: &TestApp) -> Router {
    let state = Arc::new(AppState {
        db: app.db.clone(),
        config: app.config.clone(),
        event_sender: app.event_sender.clone(),
        services: app.services.clone(),
    });
    terracotta_api::app(state)
}

async fn send(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new().await;
    let (status, body) = send(router_for(&app).await, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_cart_lifecycle_over_http() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;

    let (status, cart) = send(
        router_for(&app).await,
        Method::POST,
        "/api/v1/carts",
        Some(json!({ "session_id": "sess-http" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cart_id = cart["id"].as_str().unwrap().to_string();

    let (status, with_items) = send(
        router_for(&app).await,
        Method::POST,
        &format!("/api/v1/carts/{}/items", cart_id),
        Some(json!({ "product_id": product.id, "quantity": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(with_items["items"][0]["quantity"], 2);

    let (status, totals) = send(
        router_for(&app).await,
        Method::GET,
        &format!("/api/v1/carts/{}/totals", cart_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(totals["item_count"], 2);
    assert_eq!(totals["total_weight_grams"], 1000);
}

#[tokio::test]
async fn test_unknown_cart_is_404_with_error_body() {
    let app = TestApp::new().await;
    let (status, body) = send(
        router_for(&app).await,
        Method::GET,
        "/api/v1/carts/550e8400-e29b-41d4-a716-446655440000",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not Found");
    assert!(body["message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_add_item_rejects_zero_quantity() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;

    let (status, cart) = send(
        router_for(&app).await,
        Method::POST,
        "/api/v1/carts",
        Some(json!({ "session_id": "sess-http" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cart_id = cart["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        router_for(&app).await,
        Method::POST,
        &format!("/api/v1/carts/{}/items", cart_id),
        Some(json!({ "product_id": product.id, "quantity": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_with_garbage_pending_id_resolves_to_invalid() {
    let app = TestApp::new().await;
    let (status, body) = send(
        router_for(&app).await,
        Method::GET,
        "/api/v1/payments/callback?pending_id=not-a-uuid&status=OK",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "failed");
    assert_eq!(body["reason"], "invalid_callback");
    assert_eq!(app.gateway.verify_calls(), 0);
}

#[tokio::test]
async fn test_checkout_with_empty_cart_is_rejected() {
    let app = TestApp::new().await;

    let (status, cart) = send(
        router_for(&app).await,
        Method::POST,
        "/api/v1/carts",
        Some(json!({ "session_id": "sess-http" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cart_id = cart["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        router_for(&app).await,
        Method::POST,
        "/api/v1/checkout",
        Some(json!({
            "cart_id": cart_id,
            "destination": {
                "recipient": "Mina Kazemi",
                "phone": "09123456789",
                "address_line": "12 Kiln Street",
                "city": "Salem",
                "postal_code": "97201"
            },
            "shipping_method": "standard"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("empty"));
}
