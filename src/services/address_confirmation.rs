//! Address Confirmation
//!
//! Binds an order to the caller's shipping and billing addresses, then
//! freezes a field-by-field snapshot of both. Downstream payment and
//! fulfilment read the snapshot, never the live address rows.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::Caller;
use crate::db::locks;
use crate::entities::{address, order, Address, AddressKind, AddressSnapshot, Order, OrderStatus};
use crate::errors::{ConflictKind, ServiceError};
use crate::metrics::{self, SharedMetrics};
use crate::policy::StrictnessPolicy;
use crate::services::inventory_reservation_service::active_for_cart;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SelectedAddresses {
    pub shipping_address_id: Option<Uuid>,
    pub billing_address_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DefaultAddresses {
    pub shipping_id: Option<Uuid>,
    pub billing_id: Option<Uuid>,
}

/// Addresses the caller can pick from for an order.
#[derive(Debug, Clone, Serialize)]
pub struct AddressChoices {
    pub shipping: Vec<address::Model>,
    pub billing: Vec<address::Model>,
    pub selected: SelectedAddresses,
    pub defaults: DefaultAddresses,
    pub can_continue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionOutcome {
    pub selected: SelectedAddresses,
    pub order_status: OrderStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationOutcome {
    pub order_status: OrderStatus,
    pub can_proceed_to_payment: bool,
    pub shipping: AddressSnapshot,
    pub billing: AddressSnapshot,
}

#[derive(Clone)]
pub struct AddressConfirmationService {
    db: Arc<DatabaseConnection>,
    policy: StrictnessPolicy,
    metrics: SharedMetrics,
}

fn ensure_owner(order: &order::Model, caller: &Caller) -> Result<(), ServiceError> {
    if order.user_id == Some(caller.user_id) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("order belongs to another user".into()))
    }
}

fn ensure_open(order: &order::Model) -> Result<(), ServiceError> {
    if order.is_terminal() {
        Err(ConflictKind::OrderInvalidState.into())
    } else {
        Ok(())
    }
}

async fn owned_address<C: ConnectionTrait>(
    conn: &C,
    address_id: Uuid,
    caller: &Caller,
    kind: AddressKind,
) -> Result<address::Model, ServiceError> {
    let found = Address::find_by_id(address_id)
        .filter(address::Column::UserId.eq(caller.user_id))
        .one(conn)
        .await?
        .ok_or(ServiceError::AddressNotOwned)?;
    if found.kind != kind {
        return Err(ServiceError::AddressWrongKind(address_id, kind.to_string()));
    }
    Ok(found)
}

async fn addresses_of<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    kind: AddressKind,
) -> Result<Vec<address::Model>, ServiceError> {
    Ok(Address::find()
        .filter(address::Column::UserId.eq(user_id))
        .filter(address::Column::Kind.eq(kind))
        .order_by_desc(address::Column::CreatedAt)
        .all(conn)
        .await?)
}

impl AddressConfirmationService {
    pub fn new(db: Arc<DatabaseConnection>, policy: StrictnessPolicy, metrics: SharedMetrics) -> Self {
        Self { db, policy, metrics }
    }

    #[instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn list(&self, order_number: &str, caller: &Caller) -> Result<AddressChoices, ServiceError> {
        let order = Order::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_number.to_string()))?;
        ensure_owner(&order, caller)?;

        let shipping = addresses_of(&*self.db, caller.user_id, AddressKind::Shipping).await?;
        let billing = addresses_of(&*self.db, caller.user_id, AddressKind::Billing).await?;
        let default_of = |rows: &[address::Model]| rows.iter().find(|a| a.is_default).map(|a| a.id);

        Ok(AddressChoices {
            selected: SelectedAddresses {
                shipping_address_id: order.shipping_address_id,
                billing_address_id: order.billing_address_id,
            },
            defaults: DefaultAddresses {
                shipping_id: default_of(&shipping),
                billing_id: default_of(&billing),
            },
            can_continue: !shipping.is_empty() && !billing.is_empty(),
            shipping,
            billing,
        })
    }

    /// Points the order at two of the caller's addresses.
    #[instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn select(
        &self,
        order_number: &str,
        shipping_address_id: Option<Uuid>,
        billing_address_id: Option<Uuid>,
        caller: &Caller,
    ) -> Result<SelectionOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let order = locks::lock_order_by_number(&txn, order_number)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_number.to_string()))?;
        ensure_owner(&order, caller)?;
        ensure_open(&order)?;

        let (Some(shipping_id), Some(billing_id)) = (shipping_address_id, billing_address_id) else {
            return Err(ServiceError::AddressesRequired);
        };
        owned_address(&txn, shipping_id, caller, AddressKind::Shipping).await?;
        owned_address(&txn, billing_id, caller, AddressKind::Billing).await?;

        let mut selected: order::ActiveModel = order.into();
        selected.shipping_address_id = Set(Some(shipping_id));
        selected.billing_address_id = Set(Some(billing_id));
        selected.status = Set(OrderStatus::AddressesSelected);
        selected.updated_at = Set(Utc::now());
        selected.update(&txn).await?;

        txn.commit().await?;

        self.metrics.increment(metrics::ADDRESS_SELECT_SUCCESS, 1);
        info!(order_number, %shipping_id, %billing_id, "Checkout addresses selected");
        Ok(SelectionOutcome {
            selected: SelectedAddresses {
                shipping_address_id: Some(shipping_id),
                billing_address_id: Some(billing_id),
            },
            order_status: OrderStatus::AddressesSelected,
        })
    }

    /// Freezes snapshots of the selected addresses onto the order.
    #[instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn confirm(&self, order_number: &str, caller: &Caller) -> Result<ConfirmationOutcome, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = locks::lock_order_by_number(&txn, order_number)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_number.to_string()))?;
        ensure_owner(&order, caller)?;
        ensure_open(&order)?;

        let (Some(shipping_id), Some(billing_id)) = (order.shipping_address_id, order.billing_address_id)
        else {
            return Err(ServiceError::AddressesNotSelected);
        };
        let Some(cart_id) = order.cart_id else {
            return Err(ConflictKind::OrderNotLocked.into());
        };

        if self.policy.require_active_reservations {
            let live = active_for_cart(&txn, cart_id)
                .await?
                .iter()
                .any(|r| r.is_live(now));
            if !live {
                return Err(ConflictKind::ReservationsMissing.into());
            }
        }

        let shipping = AddressSnapshot::from(&owned_address(&txn, shipping_id, caller, AddressKind::Shipping).await?);
        let billing = AddressSnapshot::from(&owned_address(&txn, billing_id, caller, AddressKind::Billing).await?);

        let mut confirmed: order::ActiveModel = order.into();
        confirmed.shipping_snapshot = Set(Some(shipping.clone()));
        confirmed.billing_snapshot = Set(Some(billing.clone()));
        confirmed.status = Set(OrderStatus::AddressesSelected);
        confirmed.updated_at = Set(now);
        confirmed.update(&txn).await?;

        txn.commit().await?;

        self.metrics.increment(metrics::ADDRESS_CONFIRM_SUCCESS, 1);
        info!(order_number, "Checkout addresses confirmed");
        Ok(ConfirmationOutcome {
            order_status: OrderStatus::AddressesSelected,
            can_proceed_to_payment: true,
            shipping,
            billing,
        })
    }
}
