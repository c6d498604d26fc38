//! Row-lock critical sections.
//!
//! Every helper issues `SELECT ... FOR UPDATE` on the connection it is given,
//! which must be an open transaction for the lock to mean anything. When a
//! transaction needs several kinds of rows it takes them in this order:
//! order, cart, the cart's reservation rows, inventory rows by
//! (product, location), sequence row.

use std::collections::{BTreeMap, BTreeSet};

use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QuerySelect, Set};
use uuid::Uuid;

use crate::entities::{cart, inventory_record, order, order_sequence};

pub type InventoryKey = (Uuid, i32);

pub async fn lock_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<order::Model>, DbErr> {
    order::Entity::find_by_id(order_id)
        .lock_exclusive()
        .one(conn)
        .await
}

pub async fn lock_order_by_number<C: ConnectionTrait>(
    conn: &C,
    order_number: &str,
) -> Result<Option<order::Model>, DbErr> {
    order::Entity::find()
        .filter(order::Column::OrderNumber.eq(order_number))
        .lock_exclusive()
        .one(conn)
        .await
}

pub async fn lock_cart<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Option<cart::Model>, DbErr> {
    cart::Entity::find_by_id(cart_id)
        .lock_exclusive()
        .one(conn)
        .await
}

/// Locks the inventory rows for `keys` in key order.
///
/// Keys without a row are absent from the result; callers treat them as
/// zero stock.
pub async fn lock_inventory_rows<C, I>(
    conn: &C,
    keys: I,
) -> Result<BTreeMap<InventoryKey, inventory_record::Model>, DbErr>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = InventoryKey>,
{
    let ordered: BTreeSet<InventoryKey> = keys.into_iter().collect();
    let mut rows = BTreeMap::new();
    for key in ordered {
        if let Some(row) = inventory_record::Entity::find_by_id(key)
            .lock_exclusive()
            .one(conn)
            .await?
        {
            rows.insert(key, row);
        }
    }
    Ok(rows)
}

/// Creates the counter row for `day` if missing, then locks it.
pub async fn lock_sequence_row<C: ConnectionTrait>(
    conn: &C,
    day: &str,
) -> Result<order_sequence::Model, DbErr> {
    let seed = order_sequence::ActiveModel {
        day: Set(day.to_string()),
        last_seq: Set(0),
    };
    order_sequence::Entity::insert(seed)
        .on_conflict(
            OnConflict::column(order_sequence::Column::Day)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    order_sequence::Entity::find_by_id(day.to_string())
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("order sequence {day}")))
}
