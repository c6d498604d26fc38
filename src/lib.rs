//! Storefront API library
//!
//! Cart, reservation, checkout and payment-settlement engine for a single
//! storefront. All contention is resolved with row locks inside store
//! transactions; see [`db::locks`] for the lock order.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod middleware_helpers;
pub mod migrator;
pub mod money;
pub mod policy;
pub mod rate_limiter;
pub mod services;
pub mod tracing;
pub mod webhooks;

use std::sync::Arc;

use axum::{response::Json, routing::get, Router};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::config::AppConfig;
use crate::metrics::SharedMetrics;
use crate::policy::StrictnessPolicy;
use crate::services::{ServiceContainer, ServiceFactory};
use crate::webhooks::SignatureVerifier;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub policy: StrictnessPolicy,
    pub services: ServiceContainer,
    pub metrics: SharedMetrics,
    pub verifier: SignatureVerifier,
}

impl AppState {
    /// Wires every service from config.
    pub fn new(db: Arc<DatabaseConnection>, config: AppConfig, metrics: SharedMetrics) -> Self {
        let config = Arc::new(config);
        let factory = ServiceFactory::new(db.clone(), config.clone(), metrics.clone());
        Self::from_factory(db, config, metrics, &factory)
    }

    /// Same as [`AppState::new`] with a caller-built factory.
    pub fn from_factory(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        metrics: SharedMetrics,
        factory: &ServiceFactory,
    ) -> Self {
        let verifier = SignatureVerifier::new(
            config.payment_webhook_secret.clone(),
            std::time::Duration::from_secs(config.payment_webhook_tolerance_secs),
        );
        Self {
            policy: factory.policy(),
            services: ServiceContainer::new(factory),
            db,
            config,
            metrics,
            verifier,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "Storefront API", description = "Carts, checkout and payment settlement"),
    components(schemas(errors::ErrorResponse)),
    tags(
        (name = "Cart", description = "Cart lines, pricing and stock locks"),
        (name = "Checkout", description = "Order creation and address confirmation"),
        (name = "Payments", description = "Payment intents and provider notifications")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The complete application router: `/api/v1` plus the OpenAPI document,
/// wrapped in tracing and request-id layers.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", handlers::api_v1_routes())
        .route("/api-docs/openapi.json", get(openapi_json))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
}
