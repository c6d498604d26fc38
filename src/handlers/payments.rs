use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use validator::Validate;

use crate::{
    errors::ServiceError,
    handlers::common::{created_response, success_response, validate_input},
    metrics,
    services::payments::{signed_payment_id, Notification},
    AppState,
};

/// Creates the router for payment endpoints
pub fn payments_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/intents", post(open_intent))
        .route("/webhook", post(payment_webhook))
}

#[derive(Debug, Deserialize, Validate)]
pub struct OpenIntentRequest {
    #[validate(length(min = 1))]
    pub order_number: String,
}

/// Open (or reuse) the payment intent for an order with confirmed addresses
async fn open_intent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OpenIntentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let intent = state.services.payments.open_intent(&payload.order_number).await?;
    Ok(created_response(intent))
}

// POST /api/v1/payments/webhook
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid json: {e}")))?;

    let payment_id = signed_payment_id(&payload);
    if let Err(err) = state
        .verifier
        .verify(&headers, &payment_id, chrono::Utc::now().timestamp())
    {
        state.metrics.increment(metrics::WEBHOOK_REJECTED, 1);
        warn!(code = err.code(), %payment_id, "Payment webhook rejected");
        return Err(err.into());
    }

    let notification = Notification::from_payload(payload);
    info!(payment_id = ?notification.payment_id, "Payment webhook accepted");
    let ack = state.services.payments.settle(notification).await?;
    Ok(success_response(ack))
}
