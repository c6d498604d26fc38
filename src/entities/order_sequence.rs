use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-day order number counter.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_sequences")]
pub struct Model {
    /// Calendar day as `YYYYMMDD`
    #[sea_orm(primary_key, auto_increment = false)]
    pub day: String,
    pub last_seq: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
