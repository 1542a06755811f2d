//! # API 密钥实体定义
//!
//! 上游凭证表的 Sea-ORM 实体模型。`key_value` 落库时始终为密文，
//! 明文只在内存中短暂存在；`(group_id, key_hash)` 唯一，用于去重

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// API 密钥实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub group_id: i32,
    /// 密文形态的上游凭证
    #[serde(skip_serializing)]
    pub key_value: String,
    pub key_hash: String,
    /// pending / active / degraded / disabled / invalid
    pub status: String,
    pub request_count: i64,
    /// 累计失败总数，由 Provider 的状态更新路径维护
    pub failure_count: i64,
    /// 连续失败次数，由状态服务维护，成功即清零
    pub consecutive_failures: i64,
    pub backoff_level: i32,
    pub last_used_at: Option<DateTime>,
    pub last_failure_at: Option<DateTime>,
    pub last_success_at: Option<DateTime>,
    pub last_validated_at: Option<DateTime>,
    pub disabled_until: Option<DateTime>,
    pub last_error_message: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
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
