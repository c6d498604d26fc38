//! Thin HTTP adapter: extract, validate, call a service, render.

pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod payments;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub use carts::carts_routes;
pub use checkout::checkout_routes;
pub use payments::payments_routes;

/// Every route served under `/api/v1`.
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health))
        .nest("/cart", carts_routes())
        .nest("/checkout", checkout_routes())
        .nest("/payments", payments_routes())
}
