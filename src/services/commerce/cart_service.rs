use crate::{
    auth::{CartIdentity, Caller},
    db::locks,
    entities::{cart, cart_line, order, Cart, CartLine, CartStatus, Order, PriceTier, Product},
    errors::{ConflictKind, ServiceError},
    metrics::{self, SharedMetrics},
    money,
    policy::StrictnessPolicy,
    rate_limiter::RateLimiter,
    services::{
        commerce::pricing_service::resolve_in,
        inventory_reservation_service::{InventoryReservationService, ReserveOutcome},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Query, SimpleExpr}, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Shopping cart service.
///
/// A cart is identified either by its owning user or by an opaque guest
/// session token. The service keeps one "current" draft per identity (the
/// most recently updated one), merges repeated products into a single line,
/// and reprices a line whenever its quantity changes.
///
/// Locking and unlocking delegate to the [`InventoryReservationService`];
/// a locked cart is immutable unless the [`StrictnessPolicy`] allows adding
/// to it, in which case its reservations are released first.
///
/// # Examples
///
/// ```ignore
/// let identity = CartIdentity::new(caller.as_ref(), session);
/// let view = cart_service
///     .add_item(&identity, "10.0.0.7", product_id, 2, caller.as_ref())
///     .await?;
/// assert_eq!(view.lines[0].product_id, product_id);
/// ```
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    reservations: InventoryReservationService,
    rate_limiter: RateLimiter,
    policy: StrictnessPolicy,
    metrics: SharedMetrics,
    default_currency: String,
}

/// Cart contents as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub cart_id: Uuid,
    pub currency: String,
    pub status: CartStatus,
    pub lines: Vec<CartLineView>,
    pub totals: CartTotals,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CartLineView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub qty: i32,
    pub unit_price: Decimal,
    pub tier: PriceTier,
    pub subtotal: Decimal,
}

impl From<&cart_line::Model> for CartLineView {
    fn from(line: &cart_line::Model) -> Self {
        Self {
            id: line.id,
            product_id: line.product_id,
            qty: line.qty,
            unit_price: money::round_minor(line.unit_price),
            tier: line.tier,
            subtotal: money::round_minor(line.subtotal),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub items_count: i64,
}

/// Sum of line subtotals (rounded) and of quantities.
pub fn totals(lines: &[cart_line::Model]) -> CartTotals {
    CartTotals {
        subtotal: money::sum(lines.iter().map(|l| l.subtotal)),
        items_count: lines.iter().map(|l| i64::from(l.qty)).sum(),
    }
}

fn owns(identity: &CartIdentity, cart: &cart::Model) -> bool {
    let by_user = identity.user_id.is_some() && cart.user_id == identity.user_id;
    let by_session = identity.session_id.is_some()
        && cart.session_id == identity.session_id
        && (cart.user_id.is_none() || cart.user_id == identity.user_id);
    by_user || by_session
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        reservations: InventoryReservationService,
        rate_limiter: RateLimiter,
        policy: StrictnessPolicy,
        metrics: SharedMetrics,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            reservations,
            rate_limiter,
            policy,
            metrics,
            default_currency: default_currency.into(),
        }
    }

    /// Most recently updated draft for the identity that no order points
    /// at, user first, then session; creates one when neither has one.
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, identity: &CartIdentity) -> Result<cart::Model, ServiceError> {
        if let Some(user_id) = identity.user_id {
            if let Some(cart) = latest(&*self.db, cart::Column::UserId.eq(user_id), true).await? {
                return Ok(cart);
            }
        }
        if let Some(session_id) = &identity.session_id {
            if let Some(cart) = latest(&*self.db, by_session(session_id, identity.user_id), true).await? {
                return Ok(cart);
            }
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(identity.user_id),
            session_id: Set(identity.session_id.clone()),
            currency: Set(self.default_currency.clone()),
            status: Set(CartStatus::Draft),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(cart_id = %cart.id, "Created cart");
        Ok(cart)
    }

    /// The cart this identity would check out: most recently updated of any
    /// status, user first, then session.
    #[instrument(skip(self))]
    pub async fn current_for(&self, identity: &CartIdentity) -> Result<Option<cart::Model>, ServiceError> {
        if let Some(user_id) = identity.user_id {
            if let Some(cart) = latest(&*self.db, cart::Column::UserId.eq(user_id), false).await? {
                return Ok(Some(cart));
            }
        }
        match &identity.session_id {
            Some(session_id) => latest(&*self.db, by_session(session_id, identity.user_id), false).await,
            None => Ok(None),
        }
    }

    /// The cart a shopper is working on. A locked cart stays current until
    /// an order is started from it; after that a fresh draft takes over.
    #[instrument(skip(self))]
    pub async fn working_cart(&self, identity: &CartIdentity) -> Result<cart::Model, ServiceError> {
        if let Some(cart) = self.current_for(identity).await? {
            if order_for_cart(&*self.db, cart.id).await?.is_none() {
                return Ok(cart);
            }
        }
        self.get_or_create(identity).await
    }

    /// The cart `lock` reserves for. A cart whose open order lost its
    /// reservations is locked again as is, so payment can be retried;
    /// otherwise the working cart.
    async fn lock_target(&self, identity: &CartIdentity) -> Result<cart::Model, ServiceError> {
        if let Some(cart) = self.current_for(identity).await? {
            match order_for_cart(&*self.db, cart.id).await? {
                None => return Ok(cart),
                Some(order) if !order.is_terminal() => return Ok(cart),
                Some(_) => {}
            }
        }
        self.get_or_create(identity).await
    }

    #[instrument(skip(self))]
    pub async fn view(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::CartNotFound)?;
        let lines = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .order_by_desc(cart_line::Column::UpdatedAt)
            .order_by_desc(cart_line::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(CartView {
            cart_id,
            currency: cart.currency,
            status: cart.status,
            totals: totals(&lines),
            lines: lines.iter().map(CartLineView::from).collect(),
        })
    }

    /// Rate-limited add to the identity's working cart, keyed by client.
    #[instrument(skip(self, caller))]
    pub async fn add_item(
        &self,
        identity: &CartIdentity,
        client: &str,
        product_id: Uuid,
        qty: i32,
        caller: Option<&Caller>,
    ) -> Result<CartView, ServiceError> {
        self.rate_limiter.check(&format!("cart_items:{client}")).await?;
        if qty <= 0 {
            return Err(ServiceError::InvalidQuantity(qty));
        }
        let cart = self.working_cart(identity).await?;
        self.add_line(cart.id, product_id, qty, caller).await
    }

    /// Adds `qty` of a product, merging into an existing line.
    ///
    /// The line is repriced against the merged quantity, so crossing the
    /// wholesale threshold reprices every unit on it.
    #[instrument(skip(self, caller))]
    pub async fn add_line(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        qty: i32,
        caller: Option<&Caller>,
    ) -> Result<CartView, ServiceError> {
        if qty <= 0 {
            return Err(ServiceError::InvalidQuantity(qty));
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let cart = locks::lock_cart(&txn, cart_id)
            .await?
            .ok_or(ServiceError::CartNotFound)?;
        Product::find_by_id(product_id)
            .one(&txn)
            .await?
            .filter(|p| p.is_active)
            .ok_or(ServiceError::ProductNotFound(product_id))?;
        ensure_no_order(&txn, cart.id).await?;

        let released = self.unlock_for_edit(&txn, &cart, now).await?;

        let existing = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .filter(cart_line::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        match existing {
            Some(line) => {
                let prospective = line
                    .qty
                    .checked_add(qty)
                    .ok_or(ServiceError::InvalidQuantity(qty))?;
                let price = resolve_in(&txn, product_id, prospective, caller).await?;
                let mut line: cart_line::ActiveModel = line.into();
                line.qty = Set(prospective);
                line.tier = Set(price.tier);
                line.currency = Set(price.currency);
                line.unit_price = Set(price.unit_price);
                line.subtotal = Set(money::line_subtotal(price.unit_price, prospective));
                line.updated_at = Set(now);
                line.update(&txn).await?;
            }
            None => {
                let price = resolve_in(&txn, product_id, qty, caller).await?;
                cart_line::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(product_id),
                    tier: Set(price.tier),
                    currency: Set(price.currency),
                    unit_price: Set(price.unit_price),
                    qty: Set(qty),
                    subtotal: Set(money::line_subtotal(price.unit_price, qty)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        touch(&txn, cart_id, now).await?;
        txn.commit().await?;

        if released > 0 {
            self.metrics.increment(metrics::RESERVATION_RELEASED, released);
        }
        info!(%cart_id, %product_id, qty, "Added item to cart");
        self.view(cart_id).await
    }

    /// Changes a line's quantity.
    ///
    /// With `keep_tier` the quoted unit price stays and only the subtotal
    /// moves; otherwise tier and price are re-resolved for the new quantity.
    #[instrument(skip(self, caller))]
    pub async fn update_line_qty(
        &self,
        identity: &CartIdentity,
        line_id: Uuid,
        qty: i32,
        keep_tier: bool,
        caller: Option<&Caller>,
    ) -> Result<CartView, ServiceError> {
        if qty <= 0 {
            return Err(ServiceError::InvalidQuantity(qty));
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let line = CartLine::find_by_id(line_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::LineNotFound(line_id))?;
        let cart = locks::lock_cart(&txn, line.cart_id)
            .await?
            .filter(|c| owns(identity, c))
            .ok_or(ServiceError::LineNotFound(line_id))?;
        ensure_no_order(&txn, cart.id).await?;

        let released = self.unlock_for_edit(&txn, &cart, now).await?;

        let product_id = line.product_id;
        let unit_price = line.unit_price;
        let mut line: cart_line::ActiveModel = line.into();
        line.qty = Set(qty);
        if keep_tier {
            line.subtotal = Set(money::line_subtotal(unit_price, qty));
        } else {
            let price = resolve_in(&txn, product_id, qty, caller).await?;
            line.tier = Set(price.tier);
            line.currency = Set(price.currency);
            line.unit_price = Set(price.unit_price);
            line.subtotal = Set(money::line_subtotal(price.unit_price, qty));
        }
        line.updated_at = Set(now);
        line.update(&txn).await?;

        touch(&txn, cart.id, now).await?;
        txn.commit().await?;

        if released > 0 {
            self.metrics.increment(metrics::RESERVATION_RELEASED, released);
        }
        info!(cart_id = %cart.id, %line_id, qty, keep_tier, "Updated cart line");
        self.view(cart.id).await
    }

    /// Reserves stock for the working cart, or for the cart behind a still
    /// open order, and locks it.
    #[instrument(skip(self))]
    pub async fn lock(&self, identity: &CartIdentity) -> Result<(ReserveOutcome, CartView), ServiceError> {
        let cart = self.lock_target(identity).await?;
        let outcome = self.reservations.reserve(cart.id).await?;
        let view = self.view(cart.id).await?;
        Ok((outcome, view))
    }

    /// Releases the working cart's reservations and reverts it to draft.
    #[instrument(skip(self))]
    pub async fn unlock(&self, identity: &CartIdentity) -> Result<CartView, ServiceError> {
        let cart = self.working_cart(identity).await?;
        self.reservations.release(cart.id).await?;
        self.view(cart.id).await
    }

    async fn unlock_for_edit<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: &cart::Model,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        if cart.status != CartStatus::Locked {
            return Ok(0);
        }
        if !self.policy.unlock_on_add {
            return Err(ConflictKind::CartLocked.into());
        }
        let released = self.reservations.release_in(conn, cart.id, now).await?;
        info!(cart_id = %cart.id, released, "Unlocked cart for editing");
        Ok(released)
    }
}

/// Carts on this session that are anonymous or already the user's own.
fn by_session(session_id: &str, user_id: Option<Uuid>) -> SimpleExpr {
    let unclaimed = cart::Column::UserId.is_null();
    let owner = match user_id {
        Some(user_id) => unclaimed.or(cart::Column::UserId.eq(user_id)),
        None => unclaimed,
    };
    cart::Column::SessionId.eq(session_id).and(owner)
}

async fn latest<C: ConnectionTrait>(
    conn: &C,
    owner: SimpleExpr,
    drafts_only: bool,
) -> Result<Option<cart::Model>, ServiceError> {
    let mut query = Cart::find().filter(owner);
    if drafts_only {
        query = query
            .filter(cart::Column::Status.eq(CartStatus::Draft))
            .filter(
                cart::Column::Id.not_in_subquery(
                    Query::select()
                        .column(order::Column::CartId)
                        .from(Order)
                        .and_where(order::Column::CartId.is_not_null())
                        .to_owned(),
                ),
            );
    }
    Ok(query
        .order_by_desc(cart::Column::UpdatedAt)
        .one(conn)
        .await?)
}

async fn order_for_cart<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Option<order::Model>, ServiceError> {
    Ok(Order::find()
        .filter(order::Column::CartId.eq(cart_id))
        .one(conn)
        .await?)
}

/// Lines behind an order are frozen; the order's items were copied from them.
async fn ensure_no_order<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<(), ServiceError> {
    match order_for_cart(conn, cart_id).await? {
        Some(order) => Err(ConflictKind::OrderAlreadyStarted {
            order_id: order.id,
            order_number: order.order_number,
        }
        .into()),
        None => Ok(()),
    }
}

async fn touch<C: ConnectionTrait>(conn: &C, cart_id: Uuid, now: DateTime<Utc>) -> Result<(), ServiceError> {
    Cart::update_many()
        .col_expr(cart::Column::UpdatedAt, Expr::value(now))
        .filter(cart::Column::Id.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(())
}
