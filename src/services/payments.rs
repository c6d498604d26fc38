//! Payment Settlement
//!
//! Opens payment intents for confirmed orders and applies provider
//! notifications to orders, intents and reservations. A notification is
//! applied inside one transaction that locks the order row first; a second
//! delivery for an order that already reached a terminal state is recorded
//! and acknowledged as `already_final` without touching stock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::locks;
use crate::entities::{
    order, payment_intent, IntentStatus, Order, OrderStatus, PaymentIntent, PaymentStatus,
};
use crate::errors::{ConflictKind, ServiceError};
use crate::metrics::{self, SharedMetrics};
use crate::policy::StrictnessPolicy;
use crate::services::inventory_reservation_service::InventoryReservationService;

pub const PROVIDER: &str = "mp";
const PREFERENCE_URL_BASE: &str = "https://sandbox.mercadopago.com/init";

/// Provider status carried by a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingStatus {
    Approved,
    Rejected,
    Cancelled,
    Expired,
    InProcess,
    Missing,
    Unrecognized(String),
}

impl IncomingStatus {
    /// Lower-cases the raw value. A missing status only counts as approved
    /// when the policy says so.
    pub fn parse(raw: Option<&str>, policy: &StrictnessPolicy) -> Self {
        let raw = raw.map(|s| s.trim().to_ascii_lowercase()).unwrap_or_default();
        match raw.as_str() {
            "" if policy.default_missing_status_to_approved => Self::Approved,
            "" => Self::Missing,
            "approved" | "paid" => Self::Approved,
            "rejected" => Self::Rejected,
            "cancelled" => Self::Cancelled,
            "expired" => Self::Expired,
            "in_process" => Self::InProcess,
            _ => Self::Unrecognized(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationEffect {
    Consume,
    Release,
    Keep,
}

/// What a status does; `None` leaves the field as it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub intent: Option<IntentStatus>,
    pub order: Option<OrderStatus>,
    pub payment: Option<PaymentStatus>,
    pub effect: ReservationEffect,
}

pub fn transition(status: &IncomingStatus) -> Transition {
    use ReservationEffect::*;
    let t = |intent, order, payment, effect| Transition {
        intent,
        order,
        payment,
        effect,
    };
    match status {
        IncomingStatus::Approved => t(
            Some(IntentStatus::Approved),
            Some(OrderStatus::Paid),
            Some(PaymentStatus::Approved),
            Consume,
        ),
        IncomingStatus::Rejected => t(
            Some(IntentStatus::Rejected),
            None,
            Some(PaymentStatus::Rejected),
            Release,
        ),
        IncomingStatus::Cancelled => t(
            Some(IntentStatus::Cancelled),
            Some(OrderStatus::Cancelled),
            Some(PaymentStatus::Cancelled),
            Release,
        ),
        IncomingStatus::Expired => t(
            Some(IntentStatus::Expired),
            Some(OrderStatus::Expired),
            Some(PaymentStatus::Expired),
            Release,
        ),
        IncomingStatus::InProcess => t(
            None,
            None,
            Some(PaymentStatus::InProcess),
            Keep,
        ),
        IncomingStatus::Missing | IncomingStatus::Unrecognized(_) => t(None, None, None, Keep),
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `data.id` as it enters the signed string; empty when absent.
pub fn signed_payment_id(payload: &Value) -> String {
    payload
        .get("data")
        .and_then(|d| d.get("id"))
        .and_then(scalar_to_string)
        .unwrap_or_default()
}

/// Fields read from a provider notification body.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub payment_id: Option<String>,
    pub status: Option<String>,
    pub external_reference: Option<String>,
    pub raw: Value,
}

impl Notification {
    pub fn from_payload(raw: Value) -> Self {
        let data = raw.get("data");
        let payment_id = data
            .and_then(|d| d.get("id"))
            .and_then(scalar_to_string)
            .or_else(|| raw.get("id").and_then(scalar_to_string))
            .or_else(|| raw.get("payment_id").and_then(scalar_to_string));
        let status = data
            .and_then(|d| d.get("status"))
            .and_then(scalar_to_string)
            .or_else(|| raw.get("status").and_then(scalar_to_string))
            .map(|s| s.to_ascii_lowercase());
        let external_reference = raw.get("external_reference").and_then(scalar_to_string);
        Self {
            payment_id,
            status,
            external_reference,
            raw,
        }
    }
}

/// Body acknowledged back to the provider.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettlementAck {
    pub status: &'static str,
    pub order_status: String,
    pub order_payment_status: PaymentStatus,
}

impl SettlementAck {
    fn new(order_status: impl Into<String>, payment: PaymentStatus) -> Self {
        Self {
            status: "ok",
            order_status: order_status.into(),
            order_payment_status: payment,
        }
    }
}

/// Checkout-side view of an opened intent.
#[derive(Debug, Clone, Serialize)]
pub struct OpenedIntent {
    pub intent_id: Uuid,
    pub provider: String,
    pub status: IntentStatus,
    pub amount: rust_decimal::Decimal,
    pub currency: String,
    pub preference_id: Option<String>,
    pub preference_url: Option<String>,
    pub external_reference: Option<String>,
}

impl From<payment_intent::Model> for OpenedIntent {
    fn from(i: payment_intent::Model) -> Self {
        Self {
            intent_id: i.id,
            provider: i.provider,
            status: i.status,
            amount: crate::money::round_minor(i.amount),
            currency: i.currency,
            preference_id: i.preference_id,
            preference_url: i.preference_url,
            external_reference: i.external_reference,
        }
    }
}

#[derive(Debug, Default)]
struct Applied {
    approved: bool,
    consumed: u64,
    released: u64,
}

/// Persistence failures caused by a value the schema refuses, as opposed to
/// connectivity or logic errors.
pub fn is_structural(err: &ServiceError) -> bool {
    match err {
        ServiceError::DatabaseError(DbErr::Type(_) | DbErr::Json(_)) => true,
        ServiceError::DatabaseError(e @ (DbErr::Exec(_) | DbErr::Query(_))) => {
            let msg = e.to_string().to_ascii_lowercase();
            msg.contains("check constraint")
                || msg.contains("invalid input value for enum")
                || msg.contains("value too long")
        }
        _ => false,
    }
}

#[derive(Clone)]
pub struct PaymentSettlementService {
    db: Arc<DatabaseConnection>,
    reservations: InventoryReservationService,
    policy: StrictnessPolicy,
    metrics: SharedMetrics,
}

impl PaymentSettlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        reservations: InventoryReservationService,
        policy: StrictnessPolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            db,
            reservations,
            policy,
            metrics,
        }
    }

    /// Opens a payment intent for an order whose addresses are confirmed.
    ///
    /// An open intent that has not yet seen a provider payment is reused.
    #[instrument(skip(self))]
    pub async fn open_intent(&self, order_number: &str) -> Result<OpenedIntent, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = locks::lock_order_by_number(&txn, order_number)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_number.to_string()))?;
        if order.status != OrderStatus::AddressesSelected {
            return Err(ConflictKind::OrderNotReadyForPayment.into());
        }

        if let Some(open) = open_intent_for(&txn, order.id).await? {
            txn.commit().await?;
            return Ok(open.into());
        }

        let intent = payment_intent::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            provider: Set(PROVIDER.to_string()),
            status: Set(IntentStatus::Created),
            amount: Set(order.grand_total),
            currency: Set(order.currency.clone()),
            preference_id: Set(Some(format!("pref_{}", order.order_number))),
            preference_url: Set(Some(format!("{PREFERENCE_URL_BASE}/{}", order.order_number))),
            provider_payment_id: Set(None),
            external_reference: Set(Some(order.order_number.clone())),
            raw_request: Set(None),
            raw_response: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(
            order_number,
            payment_intent_id = %intent.id,
            amount = %intent.amount,
            "Payment intent opened"
        );
        Ok(intent.into())
    }

    /// Applies one verified provider notification.
    #[instrument(skip(self, notification), fields(payment_id = ?notification.payment_id))]
    pub async fn settle(&self, notification: Notification) -> Result<SettlementAck, ServiceError> {
        let now = Utc::now();
        let status = IncomingStatus::parse(notification.status.as_deref(), &self.policy);

        let txn = self.db.begin().await?;
        let order_id = match self.resolve_order(&txn, &notification).await {
            Ok(id) => id,
            Err(err) => {
                txn.rollback().await?;
                if matches!(err, ServiceError::PaymentTargetNotFound) {
                    warn!(
                        external_reference = ?notification.external_reference,
                        "Payment notification matched no order"
                    );
                }
                return Err(err);
            }
        };

        match self.settle_in(&txn, order_id, &notification, &status, now).await {
            Ok((ack, applied)) => {
                txn.commit().await?;
                self.record(&applied);
                info!(
                    %order_id,
                    order_status = %ack.order_status,
                    payment_status = %ack.order_payment_status,
                    "Payment notification applied"
                );
                Ok(ack)
            }
            Err(err) if is_structural(&err) => {
                txn.rollback().await?;
                error!(%order_id, error = %err, "Notification rejected by the store, recording best effort");
                self.degrade(order_id, &notification, &status, now).await
            }
            Err(err) => {
                txn.rollback().await?;
                Err(err)
            }
        }
    }

    async fn resolve_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        notification: &Notification,
    ) -> Result<Uuid, ServiceError> {
        if let Some(payment_id) = &notification.payment_id {
            if let Some(intent) = intent_by_payment_id(conn, payment_id).await? {
                return Ok(intent.order_id);
            }
        }
        if let Some(reference) = &notification.external_reference {
            if let Some(order) = Order::find()
                .filter(order::Column::OrderNumber.eq(reference.as_str()))
                .one(conn)
                .await?
            {
                return Ok(order.id);
            }
        }
        if self.policy.fallback_to_latest_pending_order {
            if let Some(order) = Order::find()
                .filter(order::Column::Status.eq(OrderStatus::Pending))
                .order_by_desc(order::Column::CreatedAt)
                .one(conn)
                .await?
            {
                warn!(order_number = %order.order_number, "Settling latest pending order by fallback");
                return Ok(order.id);
            }
        }
        Err(ServiceError::PaymentTargetNotFound)
    }

    async fn settle_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        notification: &Notification,
        status: &IncomingStatus,
        now: DateTime<Utc>,
    ) -> Result<(SettlementAck, Applied), ServiceError> {
        let order = locks::lock_order(conn, order_id)
            .await?
            .ok_or(ServiceError::PaymentTargetNotFound)?;

        let bound = match &notification.payment_id {
            Some(payment_id) => intent_by_payment_id(conn, payment_id).await?,
            None => None,
        };
        // a payment whose outcome is already on its intent is a replay, even
        // when the order itself is still open after a rejection
        let replayed = bound.as_ref().is_some_and(|i| i.status.is_final());
        let intent = match bound {
            Some(found) => Some(found),
            None => open_intent_for(conn, order.id).await?,
        };

        if order.is_terminal() || replayed {
            if let Some(intent) = intent {
                let mut replay: payment_intent::ActiveModel = intent.into();
                replay.raw_request = Set(Some(notification.raw.clone()));
                replay.raw_response = Set(Some(json!({
                    "order_status": order.status.to_string(),
                    "message": "already_final",
                })));
                replay.updated_at = Set(now);
                replay.update(conn).await?;
            }
            info!(order_number = %order.order_number, replayed, "Notification for settled payment ignored");
            return Ok((
                SettlementAck::new("already_final", order.payment_status),
                Applied::default(),
            ));
        }

        let intent = match intent {
            Some(intent) => intent,
            None => {
                payment_intent::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    provider: Set(PROVIDER.to_string()),
                    status: Set(IntentStatus::Created),
                    amount: Set(order.grand_total),
                    currency: Set(order.currency.clone()),
                    preference_id: Set(None),
                    preference_url: Set(None),
                    provider_payment_id: Set(notification.payment_id.clone()),
                    external_reference: Set(Some(order.order_number.clone())),
                    raw_request: Set(Some(notification.raw.clone())),
                    raw_response: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(conn)
                .await?
            }
        };

        let step = transition(status);
        let mut applied = Applied::default();

        if let Some(cart_id) = order.cart_id {
            match step.effect {
                ReservationEffect::Consume => {
                    applied.consumed = self.reservations.consume_in(conn, cart_id, now).await?;
                    if applied.consumed == 0 {
                        warn!(order_number = %order.order_number, "Approved payment found no active reservations");
                    }
                }
                ReservationEffect::Release => {
                    applied.released = self.reservations.release_in(conn, cart_id, now).await?;
                }
                ReservationEffect::Keep => {}
            }
        }
        if matches!(status, IncomingStatus::Missing | IncomingStatus::Unrecognized(_)) {
            warn!(order_number = %order.order_number, status = ?status, "Unrecognized payment status stored for audit");
        }
        applied.approved = step.effect == ReservationEffect::Consume;

        let order_status = step.order.unwrap_or(order.status);
        let payment_status = step.payment.unwrap_or(order.payment_status);

        let mut updated: order::ActiveModel = order.into();
        updated.status = Set(order_status);
        updated.payment_status = Set(payment_status);
        updated.updated_at = Set(now);
        updated.update(conn).await?;

        let mut record: payment_intent::ActiveModel = intent.clone().into();
        if let Some(next) = step.intent {
            record.status = Set(next);
        }
        if intent.provider_payment_id.is_none() {
            record.provider_payment_id = Set(notification.payment_id.clone());
        }
        record.raw_request = Set(Some(notification.raw.clone()));
        record.raw_response = Set(Some(json!({
            "order_status": order_status.to_string(),
            "order_payment_status": payment_status.to_string(),
        })));
        record.updated_at = Set(now);
        record.update(conn).await?;

        Ok((
            SettlementAck::new(order_status.to_string(), payment_status),
            applied,
        ))
    }

    /// Records what can be recorded after the store refused the full update.
    async fn degrade(
        &self,
        order_id: Uuid,
        notification: &Notification,
        status: &IncomingStatus,
        now: DateTime<Utc>,
    ) -> Result<SettlementAck, ServiceError> {
        let txn = self.db.begin().await?;
        let order = locks::lock_order(&txn, order_id)
            .await?
            .ok_or(ServiceError::PaymentTargetNotFound)?;

        let payment_status = if order.is_terminal() {
            order.payment_status
        } else {
            transition(status).payment.unwrap_or(order.payment_status)
        };
        let order_status = order.status;
        if payment_status != order.payment_status {
            let mut best_effort: order::ActiveModel = order.into();
            best_effort.payment_status = Set(payment_status);
            best_effort.updated_at = Set(now);
            best_effort.update(&txn).await?;
        }

        if let Some(payment_id) = &notification.payment_id {
            if let Some(intent) = intent_by_payment_id(&txn, payment_id).await? {
                let mut audit: payment_intent::ActiveModel = intent.into();
                audit.raw_request = Set(Some(notification.raw.clone()));
                audit.updated_at = Set(now);
                audit.update(&txn).await?;
            }
        }
        txn.commit().await?;

        Ok(SettlementAck::new(order_status.to_string(), payment_status))
    }

    fn record(&self, applied: &Applied) {
        if applied.approved {
            self.metrics.increment(metrics::PAYMENT_APPROVED, 1);
        }
        if applied.consumed > 0 {
            self.metrics
                .increment(metrics::RESERVATION_CONSUMED, applied.consumed);
        }
        if applied.released > 0 {
            self.metrics
                .increment(metrics::RESERVATION_RELEASED, applied.released);
        }
    }
}

async fn intent_by_payment_id<C: ConnectionTrait>(
    conn: &C,
    payment_id: &str,
) -> Result<Option<payment_intent::Model>, ServiceError> {
    Ok(PaymentIntent::find()
        .filter(payment_intent::Column::ProviderPaymentId.eq(payment_id))
        .one(conn)
        .await?)
}

/// Newest `created` intent of the order not yet bound to a provider payment.
async fn open_intent_for<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<payment_intent::Model>, ServiceError> {
    Ok(PaymentIntent::find()
        .filter(payment_intent::Column::OrderId.eq(order_id))
        .filter(payment_intent::Column::Status.eq(IntentStatus::Created))
        .filter(payment_intent::Column::ProviderPaymentId.is_null())
        .order_by_desc(payment_intent::Column::CreatedAt)
        .one(conn)
        .await?)
}
