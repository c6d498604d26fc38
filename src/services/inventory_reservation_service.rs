//! Inventory Reservation Service
//!
//! Owns the stock ledger counters and the reservations that hold them.
//! Each public operation runs in its own transaction; the `*_in` variants
//! take an open connection so other services can compose them into a larger
//! transaction (checkout, payment settlement).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::locks::{self, InventoryKey};
use crate::entities::{
    cart, cart_line, inventory_record, reservation, CartLine, CartStatus, InventoryRecord,
    Reservation, ReservationStatus,
};
use crate::errors::{ConflictKind, ServiceError};
use crate::metrics::{self, SharedMetrics};

/// A cart line that could not be covered by available stock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shortage {
    pub product_id: Uuid,
    pub location_id: i32,
    pub requested: i32,
    pub available: i32,
    pub missing: i32,
}

/// Result of a successful [`InventoryReservationService::reserve`].
#[derive(Debug, Clone, Serialize)]
pub struct ReserveOutcome {
    pub cart_id: Uuid,
    pub reservations: Vec<reservation::Model>,
    pub expires_at: DateTime<Utc>,
}

/// Result of an expiry sweep.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub carts: usize,
    pub reservations: u64,
}

/// Service for reserving, releasing and consuming stock.
#[derive(Clone)]
pub struct InventoryReservationService {
    db: Arc<DatabaseConnection>,
    metrics: SharedMetrics,
    ttl: Duration,
    location_id: i32,
}

impl InventoryReservationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        metrics: SharedMetrics,
        ttl: Duration,
        location_id: i32,
    ) -> Self {
        Self {
            db,
            metrics,
            ttl,
            location_id,
        }
    }

    pub fn from_config(db: Arc<DatabaseConnection>, metrics: SharedMetrics, config: &AppConfig) -> Self {
        Self::new(db, metrics, config.reservation_ttl(), config.default_location_id)
    }

    pub fn location_id(&self) -> i32 {
        self.location_id
    }

    /// `max(0, on_hand - committed)`; a missing ledger row is zero stock.
    #[instrument(skip(self))]
    pub async fn available(&self, product_id: Uuid, location_id: i32) -> Result<i32, ServiceError> {
        let row = InventoryRecord::find_by_id((product_id, location_id))
            .one(&*self.db)
            .await?;
        Ok(row.map(|r| r.available()).unwrap_or(0))
    }

    /// Reserves every line of the cart and locks it, or reports shortages
    /// without touching anything.
    #[instrument(skip(self))]
    pub async fn reserve(&self, cart_id: Uuid) -> Result<ReserveOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let outcome = match self.reserve_in(&txn, cart_id, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                txn.rollback().await?;
                if let ServiceError::InsufficientStock(shortages) = &err {
                    warn!(%cart_id, shortages = shortages.len(), "Cart lock refused, insufficient stock");
                }
                return Err(err);
            }
        };
        txn.commit().await?;

        info!(
            %cart_id,
            reservations = outcome.reservations.len(),
            expires_at = %outcome.expires_at,
            "Cart locked with stock reservations"
        );
        Ok(outcome)
    }

    pub async fn reserve_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, ServiceError> {
        let cart = locks::lock_cart(conn, cart_id)
            .await?
            .ok_or(ServiceError::CartNotFound)?;
        if cart.status == CartStatus::Locked {
            return Err(ConflictKind::CartLocked.into());
        }

        let lines = CartLine::find()
            .filter(cart_line::Column::CartId.eq(cart_id))
            .order_by_asc(cart_line::Column::ProductId)
            .all(conn)
            .await?;
        if lines.is_empty() {
            return Err(ServiceError::CartEmpty);
        }

        let mut requested: BTreeMap<InventoryKey, i32> = BTreeMap::new();
        for line in &lines {
            *requested
                .entry((line.product_id, self.location_id))
                .or_insert(0) += line.qty;
        }

        let mut rows = locks::lock_inventory_rows(conn, requested.keys().copied()).await?;

        let shortages: Vec<Shortage> = requested
            .iter()
            .filter_map(|(&(product_id, location_id), &qty)| {
                let available = rows
                    .get(&(product_id, location_id))
                    .map(|r| r.available())
                    .unwrap_or(0);
                (qty > available).then(|| Shortage {
                    product_id,
                    location_id,
                    requested: qty,
                    available,
                    missing: qty - available,
                })
            })
            .collect();
        if !shortages.is_empty() {
            return Err(ServiceError::InsufficientStock(shortages));
        }

        let expires_at = now + self.ttl;
        let mut reservations = Vec::with_capacity(lines.len());
        for line in &lines {
            let held = reservation::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                product_id: Set(line.product_id),
                location_id: Set(self.location_id),
                qty: Set(line.qty),
                status: Set(ReservationStatus::Active),
                expires_at: Set(expires_at),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await?;
            reservations.push(held);
        }

        for (key, qty) in &requested {
            let row = rows.remove(key).ok_or_else(|| {
                ServiceError::InternalError(format!("inventory row {key:?} vanished under lock"))
            })?;
            let committed = row.committed + qty;
            let mut active: inventory_record::ActiveModel = row.into();
            active.committed = Set(committed);
            active.updated_at = Set(now);
            active.update(conn).await?;
        }

        let mut locked: cart::ActiveModel = cart.into();
        locked.status = Set(CartStatus::Locked);
        locked.updated_at = Set(now);
        locked.update(conn).await?;

        Ok(ReserveOutcome {
            cart_id,
            reservations,
            expires_at,
        })
    }

    /// Releases the cart's active reservations and reverts it to draft.
    #[instrument(skip(self))]
    pub async fn release(&self, cart_id: Uuid) -> Result<u64, ServiceError> {
        let txn = self.db.begin().await?;
        let released = self.release_in(&txn, cart_id, Utc::now()).await?;
        txn.commit().await?;

        self.metrics.increment(metrics::RESERVATION_RELEASED, released);
        info!(%cart_id, released, "Cart reservations released");
        Ok(released)
    }

    /// Idempotent: with nothing active the cart still reverts to draft.
    pub async fn release_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        release_matching(conn, cart_id, now, |_| true).await
    }

    /// Consumes the cart's active reservations: stock leaves the building.
    #[instrument(skip(self))]
    pub async fn consume(&self, cart_id: Uuid) -> Result<u64, ServiceError> {
        let txn = self.db.begin().await?;
        let consumed = self.consume_in(&txn, cart_id, Utc::now()).await?;
        txn.commit().await?;

        self.metrics.increment(metrics::RESERVATION_CONSUMED, consumed);
        info!(%cart_id, consumed, "Cart reservations consumed");
        Ok(consumed)
    }

    /// Leaves the cart status untouched.
    pub async fn consume_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let active = active_for_cart(conn, cart_id).await?;
        if active.is_empty() {
            return Ok(0);
        }

        let keys: BTreeSet<InventoryKey> = active.iter().map(|r| (r.product_id, r.location_id)).collect();
        let mut rows = locks::lock_inventory_rows(conn, keys).await?;

        for held in &active {
            if let Some(row) = rows.get_mut(&(held.product_id, held.location_id)) {
                row.committed = (row.committed - held.qty).max(0);
                row.on_hand = (row.on_hand - held.qty).max(0);
            } else {
                warn!(reservation_id = %held.id, product_id = %held.product_id, "Consuming reservation without ledger row");
            }
        }
        write_rows(conn, rows, now).await?;
        mark(conn, &active, ReservationStatus::Consumed, now).await?;

        Ok(active.len() as u64)
    }

    /// Releases every active reservation past its expiry, one transaction per
    /// owning cart.
    #[instrument(skip(self))]
    pub async fn release_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let candidates = Reservation::find()
            .filter(reservation::Column::Status.eq(ReservationStatus::Active))
            .all(&*self.db)
            .await?;
        let carts: BTreeSet<Uuid> = candidates
            .iter()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.cart_id)
            .collect();

        let mut report = SweepReport::default();
        for cart_id in carts {
            let txn = self.db.begin().await?;
            let released = release_matching(&txn, cart_id, now, |r| r.expires_at <= now).await?;
            txn.commit().await?;
            if released > 0 {
                report.carts += 1;
                report.reservations += released;
            }
        }

        if report.reservations > 0 {
            self.metrics
                .increment(metrics::RESERVATION_RELEASED, report.reservations);
            info!(carts = report.carts, reservations = report.reservations, "Expired reservations released");
        }
        Ok(report)
    }
}

/// Reservations of the cart still marked active, expired or not.
pub async fn active_for_cart<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<reservation::Model>, ServiceError> {
    Ok(Reservation::find()
        .filter(reservation::Column::CartId.eq(cart_id))
        .filter(reservation::Column::Status.eq(ReservationStatus::Active))
        .order_by_asc(reservation::Column::ProductId)
        .lock_exclusive()
        .all(conn)
        .await?)
}

async fn release_matching<C, F>(
    conn: &C,
    cart_id: Uuid,
    now: DateTime<Utc>,
    matches: F,
) -> Result<u64, ServiceError>
where
    C: ConnectionTrait,
    F: Fn(&reservation::Model) -> bool,
{
    let cart = locks::lock_cart(conn, cart_id).await?;

    let targets: Vec<reservation::Model> = active_for_cart(conn, cart_id)
        .await?
        .into_iter()
        .filter(|r| matches(r))
        .collect();

    if !targets.is_empty() {
        let keys: BTreeSet<InventoryKey> = targets.iter().map(|r| (r.product_id, r.location_id)).collect();
        let mut rows = locks::lock_inventory_rows(conn, keys).await?;
        for held in &targets {
            if let Some(row) = rows.get_mut(&(held.product_id, held.location_id)) {
                row.committed = (row.committed - held.qty).max(0);
            }
        }
        write_rows(conn, rows, now).await?;
        mark(conn, &targets, ReservationStatus::Released, now).await?;
    }

    if let Some(cart) = cart {
        if cart.status != CartStatus::Draft {
            let mut draft: cart::ActiveModel = cart.into();
            draft.status = Set(CartStatus::Draft);
            draft.updated_at = Set(now);
            draft.update(conn).await?;
        }
    }

    Ok(targets.len() as u64)
}

async fn write_rows<C: ConnectionTrait>(
    conn: &C,
    rows: BTreeMap<InventoryKey, inventory_record::Model>,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    for row in rows.into_values() {
        let (committed, on_hand) = (row.committed, row.on_hand);
        let mut active: inventory_record::ActiveModel = row.into();
        active.committed = Set(committed);
        active.on_hand = Set(on_hand);
        active.updated_at = Set(now);
        active.update(conn).await?;
    }
    Ok(())
}

async fn mark<C: ConnectionTrait>(
    conn: &C,
    reservations: &[reservation::Model],
    status: ReservationStatus,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    for held in reservations {
        let mut active: reservation::ActiveModel = held.clone().into();
        active.status = Set(status);
        active.updated_at = Set(now);
        active.update(conn).await?;
    }
    Ok(())
}
