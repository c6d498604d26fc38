use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::inventory_reservation_service::Shortage;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "code": "cart_not_locked",
    "message": "Conflict: cart must be locked before checkout",
    "details": null,
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Structured detail: shortages, the existing order, ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// State preconditions that a caller can usually fix and retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    #[error("cart is locked")]
    CartLocked,
    #[error("cart must be locked before checkout")]
    CartNotLocked,
    #[error("cart belongs to a different session")]
    CartSessionMismatch,
    #[error("order {order_number} already started for this cart")]
    OrderAlreadyStarted { order_id: Uuid, order_number: String },
    #[error("order is in a terminal state")]
    OrderInvalidState,
    #[error("order is no longer linked to a cart")]
    OrderNotLocked,
    #[error("cart has no active reservations")]
    NoActiveReservations,
    #[error("cart reservations have expired")]
    ReservationsExpired,
    #[error("order has no active reservations")]
    ReservationsMissing,
    #[error("order is not ready for payment")]
    OrderNotReadyForPayment,
}

impl ConflictKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CartLocked => "cart_locked",
            Self::CartNotLocked => "cart_not_locked",
            Self::CartSessionMismatch => "cart_session_mismatch",
            Self::OrderAlreadyStarted { .. } => "order_already_started",
            Self::OrderInvalidState => "order_invalid_state",
            Self::OrderNotLocked => "order_not_locked",
            Self::NoActiveReservations => "no_active_reservations",
            Self::ReservationsExpired => "reservations_expired",
            Self::ReservationsMissing => "reservations_missing",
            Self::OrderNotReadyForPayment => "order_not_ready_for_payment",
        }
    }
}

/// Rejections of inbound payment notifications. Raised before any mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticityError {
    #[error("missing signature headers")]
    MissingSignatureHeaders,
    #[error("invalid signature format")]
    InvalidSignatureFormat,
    #[error("invalid signature fields")]
    InvalidSignatureFields,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("signature timestamp out of window")]
    TimestampOutOfWindow,
    #[error("webhook secret not configured")]
    SecretNotConfigured,
    #[error("invalid signature")]
    InvalidSignature,
}

impl AuthenticityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSignatureHeaders => "missing_signature_headers",
            Self::InvalidSignatureFormat => "invalid_signature_format",
            Self::InvalidSignatureFields => "invalid_signature_fields",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::TimestampOutOfWindow => "signature_timestamp_out_of_window",
            Self::SecretNotConfigured => "webhook_secret_not_configured",
            Self::InvalidSignature => "invalid_signature",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SecretNotConfigured => StatusCode::UNAUTHORIZED,
            Self::InvalidSignature => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i32),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cart is empty")]
    CartEmpty,

    #[error("Product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("No price configured for product {0}")]
    PriceNotFound(Uuid),

    #[error("Cart line not found: {0}")]
    LineNotFound(Uuid),

    #[error("Cart not found")]
    CartNotFound,

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Payment target not found")]
    PaymentTargetNotFound,

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Insufficient stock for {} line(s)", .0.len())]
    InsufficientStock(Vec<Shortage>),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Address does not belong to the caller")]
    AddressNotOwned,

    #[error("Address {0} is not a {1} address")]
    AddressWrongKind(Uuid, String),

    #[error("Both shipping and billing addresses are required")]
    AddressesRequired,

    #[error("Shipping and billing addresses must be selected first")]
    AddressesNotSelected,

    #[error("Webhook rejected: {0}")]
    Authenticity(AuthenticityError),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("Database error: {0}")]
    DatabaseError(#[serde(skip)] DbErr),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Connection, pool and lock-wait failures are safe to retry as a whole.
pub fn is_transient_db_err(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked")
                || msg.contains("lock timeout")
                || msg.contains("deadlock")
                || msg.contains("could not serialize")
                || msg.contains("pool timed out")
        }
        _ => false,
    }
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        if is_transient_db_err(&err) {
            ServiceError::TransientStore(err.to_string())
        } else {
            ServiceError::DatabaseError(err)
        }
    }
}

impl From<ConflictKind> for ServiceError {
    fn from(kind: ConflictKind) -> Self {
        ServiceError::Conflict(kind)
    }
}

impl From<AuthenticityError> for ServiceError {
    fn from(err: AuthenticityError) -> Self {
        ServiceError::Authenticity(err)
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::InternalError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidQuantity(_) | Self::ValidationError(_) | Self::CartEmpty => {
                StatusCode::BAD_REQUEST
            }
            Self::ProductNotFound(_)
            | Self::PriceNotFound(_)
            | Self::LineNotFound(_)
            | Self::CartNotFound
            | Self::OrderNotFound(_)
            | Self::PaymentTargetNotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InsufficientStock(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) | Self::AddressNotOwned => StatusCode::FORBIDDEN,
            Self::AddressWrongKind(..) | Self::AddressesRequired | Self::AddressesNotSelected => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Authenticity(err) => err.status_code(),
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable snake_case code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::ValidationError(_) => "validation_error",
            Self::CartEmpty => "cart_empty",
            Self::ProductNotFound(_) => "product_not_found",
            Self::PriceNotFound(_) => "price_not_found",
            Self::LineNotFound(_) => "line_not_found",
            Self::CartNotFound => "cart_not_found",
            Self::OrderNotFound(_) => "order_not_found",
            Self::PaymentTargetNotFound => "payment_target_not_found",
            Self::Conflict(kind) => kind.code(),
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::Forbidden(_) => "forbidden",
            Self::AddressNotOwned => "address_not_owned",
            Self::AddressWrongKind(..) => "address_wrong_kind",
            Self::AddressesRequired => "addresses_required",
            Self::AddressesNotSelected => "addresses_not_selected",
            Self::Authenticity(err) => err.code(),
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::Unauthorized(_) => "unauthorized",
            Self::TransientStore(_) => "store_unavailable",
            Self::DatabaseError(_) => "database_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::TransientStore(_) => "Service temporarily unavailable, retry later".to_string(),
            Self::Authenticity(_) => "Webhook rejected".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InsufficientStock(shortages) => Some(json!({ "shortages": shortages })),
            Self::Conflict(ConflictKind::OrderAlreadyStarted {
                order_id,
                order_number,
            }) => Some(json!({
                "order_id": order_id,
                "order_number": order_number,
            })),
            _ => None,
        }
    }

    pub fn is_conflict(&self, kind: &ConflictKind) -> bool {
        matches!(self, Self::Conflict(k) if k == kind)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
