//! Per-day order numbers of the form `YYYYMMDD-NNNNNN`.
//!
//! The counter row for the day is the single serialization point: it is
//! locked, bumped and written back inside the caller's transaction, so a
//! rolled-back checkout never hands its number to anyone else.

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set};

use crate::db::locks;
use crate::entities::order_sequence;
use crate::errors::ServiceError;

/// Counter key for a calendar day.
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn format_order_number(day: &str, seq: i64) -> String {
    format!("{day}-{seq:06}")
}

/// Allocates the next number for `now`'s UTC day. Must run inside the
/// transaction that inserts the order.
pub async fn next_in<C: ConnectionTrait>(conn: &C, now: DateTime<Utc>) -> Result<String, ServiceError> {
    let day = day_key(now.date_naive());
    let row = locks::lock_sequence_row(conn, &day).await?;

    let seq = row.last_seq + 1;
    let mut active: order_sequence::ActiveModel = row.into();
    active.last_seq = Set(seq);
    active.update(conn).await?;

    Ok(format_order_number(&day, seq))
}
