use crate::{
    auth::{is_privileged_seller, Caller},
    entities::{product_price, PriceTier, ProductPrice},
    errors::ServiceError,
    money,
};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Tier and unit amount chosen for a quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPrice {
    pub tier: PriceTier,
    pub unit_price: Decimal,
    pub currency: String,
}

/// Picks the price for `qty` among a product's configured prices.
///
/// Privileged sellers always get wholesale. Anyone else gets wholesale once
/// `qty` reaches its minimum quantity. A chosen tier without a configured
/// price falls back to retail; with no retail price there is no answer.
pub fn select_price(
    prices: &[product_price::Model],
    qty: i32,
    privileged: bool,
) -> Option<ResolvedPrice> {
    let find = |tier: PriceTier| prices.iter().find(|p| p.tier == tier);
    let retail = find(PriceTier::Retail);
    let wholesale = find(PriceTier::Wholesale);

    let wants_wholesale = privileged
        || wholesale
            .and_then(|w| w.min_qty)
            .is_some_and(|min| qty >= min);

    let chosen = if wants_wholesale { wholesale.or(retail) } else { retail }?;
    Some(ResolvedPrice {
        tier: chosen.tier,
        unit_price: money::round_minor(chosen.amount),
        currency: chosen.currency.clone(),
    })
}

#[derive(Debug, Clone)]
pub struct PricingService {
    db: Arc<DatabaseConnection>,
}

impl PricingService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, caller))]
    pub async fn resolve(
        &self,
        product_id: Uuid,
        qty: i32,
        caller: Option<&Caller>,
    ) -> Result<ResolvedPrice, ServiceError> {
        resolve_in(&*self.db, product_id, qty, caller).await
    }
}

pub async fn resolve_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    qty: i32,
    caller: Option<&Caller>,
) -> Result<ResolvedPrice, ServiceError> {
    let prices = ProductPrice::find()
        .filter(product_price::Column::ProductId.eq(product_id))
        .all(conn)
        .await?;
    select_price(&prices, qty, is_privileged_seller(caller))
        .ok_or(ServiceError::PriceNotFound(product_id))
}
