use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Json, Path, State},
    response::IntoResponse,
    routing::{get, patch, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{CartIdentity, MaybeCaller, SessionToken},
    entities::ReservationModel,
    errors::ServiceError,
    handlers::common::{client_key, success_response, validate_input},
    services::commerce::CartView,
    AppState,
};

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/:line_id", patch(update_item))
        .route("/lock", post(lock_cart))
        .route("/unlock", post(unlock_cart))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub qty: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1))]
    pub qty: i32,
    #[serde(default)]
    pub keep_tier: bool,
}

#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub reservations: Vec<ReservationModel>,
    pub expires_at: DateTime<Utc>,
    pub cart: CartView,
}

/// Current cart for the caller, created on first touch
async fn get_cart(
    State(state): State<Arc<AppState>>,
    MaybeCaller(caller): MaybeCaller,
    session: SessionToken,
) -> Result<impl IntoResponse, ServiceError> {
    let identity = CartIdentity::new(caller.as_ref(), session.0);
    let cart = state.services.carts.working_cart(&identity).await?;
    let view = state.services.carts.view(cart.id).await?;
    Ok(success_response(view))
}

/// Add a product to the cart, merging with an existing line
async fn add_item(
    State(state): State<Arc<AppState>>,
    MaybeCaller(caller): MaybeCaller,
    session: SessionToken,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let client = client_key(peer.as_ref(), &session);
    let identity = CartIdentity::new(caller.as_ref(), session.0);
    let view = state
        .services
        .carts
        .add_item(&identity, &client, payload.product_id, payload.qty, caller.as_ref())
        .await?;
    Ok(success_response(view))
}

/// Change the quantity on a cart line
async fn update_item(
    State(state): State<Arc<AppState>>,
    MaybeCaller(caller): MaybeCaller,
    session: SessionToken,
    Path(line_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let identity = CartIdentity::new(caller.as_ref(), session.0);
    let view = state
        .services
        .carts
        .update_line_qty(&identity, line_id, payload.qty, payload.keep_tier, caller.as_ref())
        .await?;
    Ok(success_response(view))
}

/// Reserve stock for every line and lock the cart
async fn lock_cart(
    State(state): State<Arc<AppState>>,
    MaybeCaller(caller): MaybeCaller,
    session: SessionToken,
) -> Result<impl IntoResponse, ServiceError> {
    let identity = CartIdentity::new(caller.as_ref(), session.0);
    let (outcome, cart) = state.services.carts.lock(&identity).await?;
    Ok(success_response(LockResponse {
        reservations: outcome.reservations,
        expires_at: outcome.expires_at,
        cart,
    }))
}

/// Release the cart's reservations and return it to draft
async fn unlock_cart(
    State(state): State<Arc<AppState>>,
    MaybeCaller(caller): MaybeCaller,
    session: SessionToken,
) -> Result<impl IntoResponse, ServiceError> {
    let identity = CartIdentity::new(caller.as_ref(), session.0);
    let view = state.services.carts.unlock(&identity).await?;
    Ok(success_response(view))
}
