use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::commerce::address::{self, AddressKind};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    /// At most one order per cart; cleared when a terminal order is detached.
    #[sea_orm(unique, nullable)]
    pub cart_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub session_id: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub shipping_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub discount_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub grand_total: Decimal,
    #[sea_orm(nullable)]
    pub shipping_address_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub billing_address_id: Option<Uuid>,
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_snapshot: Option<AddressSnapshot>,
    #[sea_orm(column_type = "Json", nullable)]
    pub billing_snapshot: Option<AddressSnapshot>,
    /// Free-form hints passed at checkout start; never authoritative.
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_hint: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub billing_hint: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    Items,
    #[sea_orm(has_many = "super::payment_intent::Entity")]
    PaymentIntents,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl Related<super::payment_intent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentIntents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(30))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "addresses_selected")]
    AddressesSelected,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled | Self::Expired)
    }
}

/// Provider-side view of the payment, decoupled from [`OrderStatus`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "in_process")]
    InProcess,
}

/// Field-by-field copy of an address frozen at confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct AddressSnapshot {
    pub id: Uuid,
    pub kind: AddressKind,
    pub name: String,
    pub street: String,
    pub city: String,
    pub province: String,
    pub zip_code: String,
    pub country: String,
    pub phone: Option<String>,
    pub is_default: bool,
}

impl From<&address::Model> for AddressSnapshot {
    fn from(a: &address::Model) -> Self {
        Self {
            id: a.id,
            kind: a.kind,
            name: a.name.clone(),
            street: a.street.clone(),
            city: a.city.clone(),
            province: a.province.clone(),
            zip_code: a.zip_code.clone(),
            country: a.country.clone(),
            phone: a.phone.clone(),
            is_default: a.is_default,
        }
    }
}
