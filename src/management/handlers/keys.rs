//! # 密钥管理

use axum::extract::{Path, Query, State};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ProxyError;
use crate::keypool::KeyTestResult;
use crate::management::response::{ApiResponse, Pagination};
use crate::management::state::ManagementState;

/// 密钥文本解析：换行或逗号分隔
fn parse_keys_text(text: &str) -> Vec<String> {
    text.split(['\n', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct KeysRequest {
    pub group_id: i32,
    /// 换行或逗号分隔的密钥文本
    pub keys_text: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupScopedRequest {
    pub group_id: i32,
}

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    pub group_id: i32,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    20
}

/// 分页列出分组内的密钥
pub async fn list_keys(
    State(state): State<ManagementState>,
    Query(query): Query<ListKeysQuery>,
) -> ApiResponse<Vec<entity::api_keys::Model>> {
    let mut finder = entity::api_keys::Entity::find()
        .filter(entity::api_keys::Column::GroupId.eq(query.group_id));
    if let Some(status) = &query.status {
        finder = finder.filter(entity::api_keys::Column::Status.eq(status.as_str()));
    }

    let total = match finder.clone().count(state.db.as_ref()).await {
        Ok(total) => total,
        Err(err) => return ProxyError::from(err).into(),
    };

    let limit = query.limit.clamp(1, 500);
    let page = query.page.max(1);
    let rows = match finder
        .order_by_asc(entity::api_keys::Column::Id)
        .offset((page - 1) * limit)
        .limit(limit)
        .all(state.db.as_ref())
        .await
    {
        Ok(rows) => rows,
        Err(err) => return ProxyError::from(err).into(),
    };

    ApiResponse::Paginated(rows, Pagination::new(page, limit, total))
}

/// 批量添加密钥
pub async fn add_keys(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<KeysRequest>,
) -> ApiResponse<Value> {
    let keys = parse_keys_text(&payload.keys_text);
    if keys.is_empty() {
        return ProxyError::validation("no keys provided", Some("keys_text".to_string())).into();
    }

    match state.provider.add_keys(payload.group_id, &keys).await {
        Ok(result) => ApiResponse::Success(json!({
            "added": result.added,
            "ignored": result.ignored,
        })),
        Err(err) => err.into(),
    }
}

/// 批量删除密钥
pub async fn delete_keys(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<KeysRequest>,
) -> ApiResponse<Value> {
    let keys = parse_keys_text(&payload.keys_text);
    if keys.is_empty() {
        return ProxyError::validation("no keys provided", Some("keys_text".to_string())).into();
    }

    match state.provider.remove_keys(payload.group_id, &keys).await {
        Ok(deleted) => ApiResponse::Success(json!({"deleted": deleted})),
        Err(err) => err.into(),
    }
}

/// 恢复列出的无效密钥
pub async fn restore_keys(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<KeysRequest>,
) -> ApiResponse<Value> {
    let keys = parse_keys_text(&payload.keys_text);
    if keys.is_empty() {
        return ProxyError::validation("no keys provided", Some("keys_text".to_string())).into();
    }

    match state
        .provider
        .restore_multiple_keys(payload.group_id, &keys)
        .await
    {
        Ok(restored) => ApiResponse::Success(json!({"restored": restored})),
        Err(err) => err.into(),
    }
}

/// 恢复分组内全部无效密钥
pub async fn restore_all_invalid(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<GroupScopedRequest>,
) -> ApiResponse<Value> {
    match state.provider.restore_keys(payload.group_id).await {
        Ok(restored) => ApiResponse::Success(json!({"restored": restored})),
        Err(err) => err.into(),
    }
}

/// 清除分组内全部无效密钥
pub async fn clear_invalid(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<GroupScopedRequest>,
) -> ApiResponse<Value> {
    match state.provider.remove_invalid_keys(payload.group_id).await {
        Ok(deleted) => ApiResponse::Success(json!({"deleted": deleted})),
        Err(err) => err.into(),
    }
}

/// 清空分组内全部密钥
pub async fn clear_all(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<GroupScopedRequest>,
) -> ApiResponse<Value> {
    match state.provider.remove_all_keys(payload.group_id).await {
        Ok(deleted) => ApiResponse::Success(json!({"deleted": deleted})),
        Err(err) => err.into(),
    }
}

/// 即时测试一组明文密钥，不入库
pub async fn test_multiple(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
    axum::Json(payload): axum::Json<Value>,
) -> ApiResponse<Vec<KeyTestResult>> {
    let keys_text = payload
        .get("keys_text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let keys = parse_keys_text(keys_text);
    if keys.is_empty() {
        return ProxyError::validation("no keys provided", Some("keys_text".to_string())).into();
    }

    let group = match state.group_manager.get_by_id(group_id).await {
        Ok(group) => group,
        Err(err) => return err.into(),
    };

    let results = state.validator.test_multiple_keys(&group, &keys).await;
    ApiResponse::Success(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys_text() {
        assert_eq!(
            parse_keys_text("sk-1\nsk-2, sk-3\n\n  "),
            vec!["sk-1", "sk-2", "sk-3"]
        );
        assert!(parse_keys_text("").is_empty());
    }
}
