//! # 分组实体定义
//!
//! 上游分组表的 Sea-ORM 实体模型，一个分组聚合一组上游地址和密钥池

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 分组实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub name: String,
    pub display_name: String,
    /// 允许访问该分组的本地代理密钥，逗号分隔
    pub proxy_keys: String,
    /// 上游基础地址列表，JSON 数组，按顺序排列
    pub upstreams: Json,
    pub validation_endpoint: String,
    pub channel_type: String,
    pub test_model: String,
    /// 请求参数覆盖，自由形式 JSON 对象
    pub param_overrides: Json,
    /// 请求头改写规则，JSON 数组
    pub header_rules: Json,
    /// 分组级配置覆盖，叠加在系统设置之上
    pub config: Json,
    pub sort: i32,
    pub last_validated_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::api_keys::Entity")]
    ApiKeys,
    #[sea_orm(has_many = "super::group_policies::Entity")]
    GroupPolicies,
}

impl Related<super::api_keys::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ApiKeys.def()
    }
}

impl Related<super::group_policies::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::GroupPolicies.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
