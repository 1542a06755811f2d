//! # 分组管理

use axum::extract::{Path, State};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProxyError;
use crate::keypool::KeyStatus;
use crate::management::response::ApiResponse;
use crate::management::state::ManagementState;

/// 创建/更新分组的请求体
#[derive(Debug, Deserialize)]
pub struct GroupUpsertRequest {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub proxy_keys: String,
    pub upstreams: Value,
    #[serde(default)]
    pub validation_endpoint: String,
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    #[serde(default)]
    pub test_model: String,
    #[serde(default = "empty_object")]
    pub param_overrides: Value,
    #[serde(default = "empty_array")]
    pub header_rules: Value,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub sort: i32,
}

fn default_channel_type() -> String {
    "openai".to_string()
}

fn empty_object() -> Value {
    json!({})
}

fn empty_array() -> Value {
    json!([])
}

#[derive(Debug, Serialize)]
pub struct GroupStats {
    pub group_id: i32,
    pub total_keys: i64,
    pub active_keys: i64,
    pub degraded_keys: i64,
    pub pending_keys: i64,
    pub disabled_keys: i64,
    pub invalid_keys: i64,
}

fn validate_upsert(payload: &GroupUpsertRequest) -> Result<(), ProxyError> {
    if payload.name.trim().is_empty() {
        return Err(ProxyError::validation(
            "group name must not be empty",
            Some("name".to_string()),
        ));
    }

    let upstreams = payload
        .upstreams
        .as_array()
        .filter(|list| !list.is_empty())
        .ok_or_else(|| {
            ProxyError::validation(
                "upstreams must be a non-empty array of URLs",
                Some("upstreams".to_string()),
            )
        })?;
    for upstream in upstreams {
        let valid = upstream
            .as_str()
            .is_some_and(|raw| url::Url::parse(raw).is_ok());
        if !valid {
            return Err(ProxyError::validation(
                format!("invalid upstream URL: {upstream}"),
                Some("upstreams".to_string()),
            ));
        }
    }
    Ok(())
}

/// 全部分组
pub async fn list_groups(
    State(state): State<ManagementState>,
) -> ApiResponse<Vec<entity::groups::Model>> {
    match state.group_manager.list().await {
        Ok(groups) => ApiResponse::Success(groups),
        Err(err) => err.into(),
    }
}

/// 创建分组
pub async fn create_group(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<GroupUpsertRequest>,
) -> ApiResponse<entity::groups::Model> {
    if let Err(err) = validate_upsert(&payload) {
        return err.into();
    }

    let exists = match entity::groups::Entity::find()
        .filter(entity::groups::Column::Name.eq(payload.name.trim()))
        .one(state.db.as_ref())
        .await
    {
        Ok(existing) => existing.is_some(),
        Err(err) => return ProxyError::from(err).into(),
    };
    if exists {
        return ProxyError::conflict("group", payload.name.trim()).into();
    }

    let now = Utc::now().naive_utc();
    let active = entity::groups::ActiveModel {
        name: Set(payload.name.trim().to_string()),
        display_name: Set(payload.display_name),
        proxy_keys: Set(payload.proxy_keys),
        upstreams: Set(payload.upstreams),
        validation_endpoint: Set(payload.validation_endpoint),
        channel_type: Set(payload.channel_type),
        test_model: Set(payload.test_model),
        param_overrides: Set(payload.param_overrides),
        header_rules: Set(payload.header_rules),
        config: Set(payload.config),
        sort: Set(payload.sort),
        last_validated_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    match active.insert(state.db.as_ref()).await {
        Ok(group) => {
            state.group_manager.publish_changed().await;
            ApiResponse::Success(group)
        }
        Err(err) => ProxyError::from(err).into(),
    }
}

/// 单个分组
pub async fn get_group(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
) -> ApiResponse<entity::groups::Model> {
    match entity::groups::Entity::find_by_id(group_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(group)) => ApiResponse::Success(group),
        Ok(None) => ProxyError::not_found("group", group_id.to_string()).into(),
        Err(err) => ProxyError::from(err).into(),
    }
}

/// 更新分组
pub async fn update_group(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
    axum::Json(payload): axum::Json<GroupUpsertRequest>,
) -> ApiResponse<entity::groups::Model> {
    if let Err(err) = validate_upsert(&payload) {
        return err.into();
    }

    let existing = match entity::groups::Entity::find_by_id(group_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(group)) => group,
        Ok(None) => return ProxyError::not_found("group", group_id.to_string()).into(),
        Err(err) => return ProxyError::from(err).into(),
    };

    let mut active: entity::groups::ActiveModel = existing.into();
    active.name = Set(payload.name.trim().to_string());
    active.display_name = Set(payload.display_name);
    active.proxy_keys = Set(payload.proxy_keys);
    active.upstreams = Set(payload.upstreams);
    active.validation_endpoint = Set(payload.validation_endpoint);
    active.channel_type = Set(payload.channel_type);
    active.test_model = Set(payload.test_model);
    active.param_overrides = Set(payload.param_overrides);
    active.header_rules = Set(payload.header_rules);
    active.config = Set(payload.config);
    active.sort = Set(payload.sort);
    active.updated_at = Set(Utc::now().naive_utc());

    match active.update(state.db.as_ref()).await {
        Ok(group) => {
            state.group_manager.publish_changed().await;
            ApiResponse::Success(group)
        }
        Err(err) => ProxyError::from(err).into(),
    }
}

/// 删除分组，级联删除密钥并清理存储
pub async fn delete_group(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
) -> ApiResponse<Value> {
    let key_ids: Vec<i64> = match entity::api_keys::Entity::find()
        .filter(entity::api_keys::Column::GroupId.eq(group_id))
        .all(state.db.as_ref())
        .await
    {
        Ok(keys) => keys.into_iter().map(|k| k.id).collect(),
        Err(err) => return ProxyError::from(err).into(),
    };

    let deleted = match entity::groups::Entity::delete_by_id(group_id)
        .exec(state.db.as_ref())
        .await
    {
        Ok(result) => result.rows_affected,
        Err(err) => return ProxyError::from(err).into(),
    };
    if deleted == 0 {
        return ProxyError::not_found("group", group_id.to_string()).into();
    }

    if let Err(err) = state
        .provider
        .remove_keys_from_store(group_id, &key_ids)
        .await
    {
        return err.into();
    }
    state.group_manager.publish_changed().await;

    ApiResponse::Success(json!({"deleted_keys": key_ids.len()}))
}

/// 分组密钥状态统计
pub async fn group_stats(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
) -> ApiResponse<GroupStats> {
    let base =
        entity::api_keys::Entity::find().filter(entity::api_keys::Column::GroupId.eq(group_id));

    let mut counts = [0i64; 5];
    for (index, status) in KeyStatus::all().iter().enumerate() {
        match base
            .clone()
            .filter(entity::api_keys::Column::Status.eq(status.as_str()))
            .count(state.db.as_ref())
            .await
        {
            Ok(count) => counts[index] = count as i64,
            Err(err) => return ProxyError::from(err).into(),
        }
    }

    ApiResponse::Success(GroupStats {
        group_id,
        total_keys: counts.iter().sum(),
        pending_keys: counts[0],
        active_keys: counts[1],
        degraded_keys: counts[2],
        disabled_keys: counts[3],
        invalid_keys: counts[4],
    })
}

/// 复制分组（不复制密钥）
pub async fn copy_group(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
) -> ApiResponse<entity::groups::Model> {
    let source = match entity::groups::Entity::find_by_id(group_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(group)) => group,
        Ok(None) => return ProxyError::not_found("group", group_id.to_string()).into(),
        Err(err) => return ProxyError::from(err).into(),
    };

    let now = Utc::now().naive_utc();
    let copy = entity::groups::ActiveModel {
        name: Set(format!("{}-copy", source.name)),
        display_name: Set(format!("{} (copy)", source.display_name)),
        proxy_keys: Set(source.proxy_keys),
        upstreams: Set(source.upstreams),
        validation_endpoint: Set(source.validation_endpoint),
        channel_type: Set(source.channel_type),
        test_model: Set(source.test_model),
        param_overrides: Set(source.param_overrides),
        header_rules: Set(source.header_rules),
        config: Set(source.config),
        sort: Set(source.sort),
        last_validated_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    match copy.insert(state.db.as_ref()).await {
        Ok(group) => {
            state.group_manager.publish_changed().await;
            ApiResponse::Success(group)
        }
        Err(err) => ProxyError::from(err).into(),
    }
}

/// 分组可用的配置项元数据
pub async fn config_options(State(_state): State<ManagementState>) -> ApiResponse<Value> {
    let options: Vec<Value> = crate::config::setting_metadata()
        .iter()
        .map(|meta| {
            json!({
                "key": meta.key,
                "kind": match meta.kind {
                    crate::config::SettingKind::Int => "int",
                    crate::config::SettingKind::Bool => "bool",
                    crate::config::SettingKind::Text => "string",
                },
                "min": meta.min,
                "default": meta.default,
                "description": meta.description,
            })
        })
        .collect();
    ApiResponse::Success(json!({"options": options}))
}
