use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Single-row table recording when the periodic fleet trigger last fired.
///
/// Lives in the database rather than in process memory so that multiple
/// worker processes agree on whether the current window has already been
/// handled.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fleet_schedule")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub last_triggered_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
