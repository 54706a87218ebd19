use crate::handlers::common::{
    created_response, map_service_error, no_content_response, success_response, validate_input,
};
use crate::{
    errors::ApiError,
    services::carts::{AddItemInput, CreateCartInput},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_cart))
        .route("/merge", post(merge_carts))
        .route("/:id", get(get_cart))
        .route("/:id/totals", get(get_totals))
        .route("/:id/items", post(add_item))
        .route("/:id/items/:item_id", put(update_item_quantity))
        .route("/:id/items/:item_id", delete(remove_item))
        .route("/:id/clear", post(clear_cart))
}

/// Create a new cart for a guest session or a customer
async fn create_cart(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCartRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: payload.session_id,
            customer_id: payload.customer_id,
        })
        .await
        .map_err(map_service_error)?;

    Ok(created_response(cart))
}

/// Get cart with items
async fn get_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .get_cart(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Derived totals for a cart
async fn get_totals(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let totals = state
        .services
        .carts
        .totals(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(totals))
}

/// Add an item to the cart (merges by product and color)
async fn add_item(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .add_item(
            cart_id,
            AddItemInput {
                product_id: payload.product_id,
                color: payload.color,
                attributes: payload.attributes,
                quantity: payload.quantity,
            },
        )
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Set a line's quantity; zero or below removes the line
async fn update_item_quantity(
    State(state): State<Arc<AppState>>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .set_item_quantity(cart_id, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Remove a line from the cart
async fn remove_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .services
        .carts
        .remove_item(cart_id, item_id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

/// Clear all items from the cart
async fn clear_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .services
        .carts
        .clear_cart(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(serde_json::json!({
        "message": "Cart cleared successfully"
    })))
}

/// Fold the guest session cart into the customer cart on login
async fn merge_carts(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MergeCartsRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .reconciler
        .merge_on_login(&payload.session_id, payload.customer_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct CreateCartRequest {
    pub session_id: Option<String>,
    pub customer_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    pub color: Option<String>,
    pub attributes: Option<serde_json::Value>,
    #[validate(range(min = 1))]
    pub quantity: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MergeCartsRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    pub customer_id: Uuid,
}
