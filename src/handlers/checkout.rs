use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{MaybeCaller, RequireCaller, SessionToken},
    errors::ServiceError,
    handlers::common::{created_response, success_response, validate_input},
    services::commerce::StartCheckout,
    AppState,
};

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/start", post(start_checkout))
        .route("/:order_number/addresses", get(list_addresses))
        .route("/:order_number/addresses/select", post(select_addresses))
        .route("/:order_number/addresses/confirm", post(confirm_addresses))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct StartCheckoutRequest {
    pub cart_id: Option<Uuid>,
    /// Free-form hints; stored verbatim, never authoritative.
    pub shipping_address: Option<Value>,
    pub billing_address: Option<Value>,
}

impl From<StartCheckoutRequest> for StartCheckout {
    fn from(req: StartCheckoutRequest) -> Self {
        Self {
            cart_id: req.cart_id,
            shipping_hint: req.shipping_address,
            billing_hint: req.billing_address,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct SelectAddressesRequest {
    pub shipping_address_id: Option<Uuid>,
    pub billing_address_id: Option<Uuid>,
}

/// Turn the locked cart into a pending order
async fn start_checkout(
    State(state): State<Arc<AppState>>,
    MaybeCaller(caller): MaybeCaller,
    session: SessionToken,
    payload: Option<Json<StartCheckoutRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    validate_input(&payload)?;

    let summary = state
        .services
        .checkout
        .start(payload.into(), caller.as_ref(), &session.0)
        .await?;
    Ok(created_response(summary))
}

async fn list_addresses(
    State(state): State<Arc<AppState>>,
    RequireCaller(caller): RequireCaller,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let choices = state.services.addresses.list(&order_number, &caller).await?;
    Ok(success_response(choices))
}

async fn select_addresses(
    State(state): State<Arc<AppState>>,
    RequireCaller(caller): RequireCaller,
    Path(order_number): Path<String>,
    Json(payload): Json<SelectAddressesRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let outcome = state
        .services
        .addresses
        .select(
            &order_number,
            payload.shipping_address_id,
            payload.billing_address_id,
            &caller,
        )
        .await?;
    Ok(success_response(outcome))
}

async fn confirm_addresses(
    State(state): State<Arc<AppState>>,
    RequireCaller(caller): RequireCaller,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.services.addresses.confirm(&order_number, &caller).await?;
    Ok(success_response(outcome))
}
