//! # 请求日志实体定义
//!
//! 每次上游尝试的追加式记录，`request_type` 区分重试与最终结果

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 请求日志实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub timestamp: DateTime,
    pub group_id: i32,
    pub key_hash: String,
    pub model: String,
    pub is_success: bool,
    pub status_code: i32,
    pub request_path: String,
    pub duration_ms: i64,
    pub error_message: String,
    /// retry / final
    pub request_type: String,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::groups::Entity",
        from = "Column::GroupId",
        to = "super::groups::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Group,
}

impl Related<super::groups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
