use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "devices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Short immutable identifier; derives the external client id. Never updated.
    pub key: String,
    pub name: Option<String>,
    pub rotation_state: String, // "ok" | "queued" | "pending" | "timeout"
    pub secret: String,         // current externally-valid secret, encrypted at rest
    pub cached_secret: Option<String>, // prior secret, kept only while a restore might be needed
    pub secret_created_at: i64,
    pub last_rotation_attempt_at: Option<i64>,
    pub last_rotation_completed_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
