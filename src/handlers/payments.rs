use crate::handlers::common::{map_service_error, success_response};
use crate::{errors::ApiError, services::settlement::CallbackParams, AppState};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Creates the router for payment endpoints
pub fn payments_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/callback", get(payment_callback))
        .route("/expire-stale", post(expire_stale))
}

/// Gateway return leg. Resolves the settlement exactly once and answers
/// replays with the recorded resolution.
async fn payment_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let resolution = state
        .services
        .settlements
        .handle_callback(params)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(resolution))
}

/// Maintenance sweep: fail pending settlements older than the configured
/// TTL
async fn expire_stale(
    State(state): State<Arc<AppState>>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let expired = state
        .services
        .settlements
        .expire_stale()
        .await
        .map_err(map_service_error)?;

    Ok(success_response(serde_json::json!({ "expired": expired })))
}
