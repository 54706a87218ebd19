use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::{
    errors::ApiError,
    services::checkout::{CheckoutInput, QuoteInput},
    AppState,
};
use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use std::sync::Arc;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(submit_checkout))
        .route("/quote", post(quote_checkout))
}

/// Price the cart for a shipping method and optional coupon, without
/// opening a settlement
async fn quote_checkout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuoteInput>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let breakdown = state
        .services
        .checkout
        .quote(payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(breakdown))
}

/// Submit the checkout and receive the gateway redirect handle
async fn submit_checkout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckoutInput>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let handoff = state
        .services
        .checkout
        .submit(payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(handoff))
}
