//! # 策略实体定义
//!
//! 类型化规则集，`config` 的结构由 `type` 决定

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 策略实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "policies")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub name: String,
    pub description: String,
    /// retry / degradation / model_filter / rate_limit
    #[sea_orm(column_name = "type")]
    pub policy_type: String,
    pub config: Json,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::group_policies::Entity")]
    GroupPolicies,
}

impl Related<super::group_policies::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::GroupPolicies.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
