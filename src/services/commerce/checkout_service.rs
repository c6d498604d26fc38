use crate::{
    auth::{CartIdentity, Caller},
    db::locks,
    entities::{
        cart_line, order, order_item, product, CartLine, CartStatus, Order, OrderStatus,
        PaymentStatus, PriceTier, Product,
    },
    errors::{ConflictKind, ServiceError},
    metrics::{self, SharedMetrics},
    money,
    policy::StrictnessPolicy,
    services::{
        commerce::cart_service::CartService, inventory_reservation_service::active_for_cart,
        order_sequence,
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Input for [`CheckoutService::start`].
#[derive(Debug, Clone, Default)]
pub struct StartCheckout {
    /// Falls back to the caller's current cart.
    pub cart_id: Option<Uuid>,
    pub shipping_hint: Option<Value>,
    pub billing_hint: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OrderTotals {
    pub currency: String,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub discount_total: Decimal,
    pub grand_total: Decimal,
}

impl From<&order::Model> for OrderTotals {
    fn from(o: &order::Model) -> Self {
        Self {
            currency: o.currency.clone(),
            subtotal: money::round_minor(o.subtotal),
            shipping_cost: money::round_minor(o.shipping_cost),
            discount_total: money::round_minor(o.discount_total),
            grand_total: money::round_minor(o.grand_total),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub name: String,
    pub sku: String,
    pub tier: PriceTier,
    pub currency: String,
    pub qty: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

impl From<&order_item::Model> for OrderItemView {
    fn from(i: &order_item::Model) -> Self {
        Self {
            product_id: i.product_id,
            name: i.name.clone(),
            sku: i.sku.clone(),
            tier: i.tier,
            currency: i.currency.clone(),
            qty: i.qty,
            unit_price: money::round_minor(i.unit_price),
            subtotal: money::round_minor(i.subtotal),
        }
    }
}

/// What a started checkout returns.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSummary {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub totals: OrderTotals,
    pub items: Vec<OrderItemView>,
}

/// Turns a locked cart into an order exactly once.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    policy: StrictnessPolicy,
    metrics: SharedMetrics,
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        policy: StrictnessPolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            db,
            carts,
            policy,
            metrics,
        }
    }

    /// Creates the order for a locked cart.
    ///
    /// Safe to retry: a cart that already has a live order answers with
    /// `OrderAlreadyStarted` naming it, including when two calls race and the
    /// loser trips the unique cart reference.
    #[instrument(skip(self, request, caller), fields(cart_id = tracing::field::Empty))]
    pub async fn start(
        &self,
        request: StartCheckout,
        caller: Option<&Caller>,
        session_id: &str,
    ) -> Result<CheckoutSummary, ServiceError> {
        let cart_id = match request.cart_id {
            Some(id) => id,
            None => {
                self.carts
                    .current_for(&CartIdentity::new(caller, session_id))
                    .await?
                    .ok_or(ServiceError::CartNotFound)?
                    .id
            }
        };
        tracing::Span::current().record("cart_id", tracing::field::display(cart_id));

        let txn = self.db.begin().await?;
        let result = self
            .start_in(&txn, cart_id, request, caller, session_id, Utc::now())
            .await;

        let summary = match result {
            Ok(summary) => summary,
            Err(ServiceError::DatabaseError(err)) if is_unique_violation(&err) => {
                txn.rollback().await?;
                warn!(%cart_id, "Concurrent checkout lost the race for this cart");
                let existing = Order::find()
                    .filter(order::Column::CartId.eq(cart_id))
                    .one(&*self.db)
                    .await?
                    .ok_or(ServiceError::DatabaseError(err))?;
                return Err(ConflictKind::OrderAlreadyStarted {
                    order_id: existing.id,
                    order_number: existing.order_number,
                }
                .into());
            }
            Err(err) => {
                txn.rollback().await?;
                return Err(err);
            }
        };
        txn.commit().await?;

        self.metrics.increment(metrics::CHECKOUT_STARTED, 1);
        info!(
            %cart_id,
            order_number = %summary.order_number,
            grand_total = %summary.totals.grand_total,
            "Checkout started"
        );
        Ok(summary)
    }

    async fn start_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        request: StartCheckout,
        caller: Option<&Caller>,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSummary, ServiceError> {
        let cart = locks::lock_cart(conn, cart_id)
            .await?
            .ok_or(ServiceError::CartNotFound)?;

        match (cart.user_id, caller) {
            (Some(owner), c) if c.map(|c| c.user_id) != Some(owner) => {
                return Err(ServiceError::Forbidden("cart belongs to another user".into()));
            }
            (None, _) if self.policy.enforce_cart_session_match => {
                if cart.session_id.as_deref().is_some_and(|s| s != session_id) {
                    return Err(ConflictKind::CartSessionMismatch.into());
                }
            }
            _ => {}
        }

        if cart.status != CartStatus::Locked {
            return Err(ConflictKind::CartNotLocked.into());
        }

        // Terminal orders are never locked together with their cart elsewhere,
        // so touching one after the cart lock cannot deadlock.
        if let Some(existing) = Order::find()
            .filter(order::Column::CartId.eq(cart_id))
            .one(conn)
            .await?
        {
            if existing.is_terminal() && self.policy.detach_terminal_orders {
                info!(order_number = %existing.order_number, "Detaching terminal order from cart");
                let mut detached: order::ActiveModel = existing.into();
                detached.cart_id = Set(None);
                detached.updated_at = Set(now);
                detached.update(conn).await?;
            } else {
                return Err(ConflictKind::OrderAlreadyStarted {
                    order_id: existing.id,
                    order_number: existing.order_number,
                }
                .into());
            }
        }

        if self.policy.require_active_reservations {
            let active = active_for_cart(conn, cart_id).await?;
            if active.is_empty() {
                return Err(ConflictKind::NoActiveReservations.into());
            }
            if active.iter().any(|r| !r.is_live(now)) {
                return Err(ConflictKind::ReservationsExpired.into());
            }
        }

        let lines = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .order_by_asc(cart_line::Column::CreatedAt)
            .all(conn)
            .await?;
        if lines.is_empty() {
            return Err(ServiceError::CartEmpty);
        }
        let catalog: HashMap<Uuid, product::Model> = Product::find()
            .filter(product::Column::Id.is_in(lines.iter().map(|l| l.product_id)))
            .all(conn)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let subtotal = money::sum(lines.iter().map(|l| l.subtotal));
        let shipping_cost = Decimal::ZERO;
        let discount_total = Decimal::ZERO;
        let grand_total = money::clamp(subtotal + shipping_cost - discount_total);

        let order_number = order_sequence::next_in(conn, now).await?;

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order_number),
            cart_id: Set(Some(cart_id)),
            user_id: Set(cart.user_id.or(caller.map(|c| c.user_id))),
            session_id: Set(cart.session_id.clone()),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            currency: Set(cart.currency.clone()),
            subtotal: Set(subtotal),
            shipping_cost: Set(shipping_cost),
            discount_total: Set(discount_total),
            grand_total: Set(grand_total),
            shipping_address_id: Set(None),
            billing_address_id: Set(None),
            shipping_snapshot: Set(None),
            billing_snapshot: Set(None),
            shipping_hint: Set(request.shipping_hint),
            billing_hint: Set(request.billing_hint),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let (name, sku) = catalog
                .get(&line.product_id)
                .map(|p| (p.name.clone(), p.sku.clone()))
                .unwrap_or_default();
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                name: Set(name),
                sku: Set(sku),
                tier: Set(line.tier),
                currency: Set(cart.currency.clone()),
                qty: Set(line.qty),
                unit_price: Set(money::round_minor(line.unit_price)),
                subtotal: Set(money::round_minor(line.subtotal)),
            }
            .insert(conn)
            .await?;
            items.push(OrderItemView::from(&item));
        }

        Ok(CheckoutSummary {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            totals: OrderTotals::from(&order),
            items,
        })
    }
}
