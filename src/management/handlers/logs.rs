//! # 请求日志查询与导出

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;

use crate::error::ProxyError;
use crate::management::response::{ApiResponse, Pagination};
use crate::management::state::ManagementState;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub group_id: Option<i32>,
    #[serde(default)]
    pub is_success: Option<bool>,
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    50
}

fn build_finder(query: &LogsQuery) -> sea_orm::Select<entity::request_logs::Entity> {
    let mut finder = entity::request_logs::Entity::find();
    if let Some(group_id) = query.group_id {
        finder = finder.filter(entity::request_logs::Column::GroupId.eq(group_id));
    }
    if let Some(is_success) = query.is_success {
        finder = finder.filter(entity::request_logs::Column::IsSuccess.eq(is_success));
    }
    if let Some(request_type) = &query.request_type {
        finder = finder.filter(entity::request_logs::Column::RequestType.eq(request_type.as_str()));
    }
    finder
}

/// 分页查询请求日志
pub async fn list_logs(
    State(state): State<ManagementState>,
    Query(query): Query<LogsQuery>,
) -> ApiResponse<Vec<entity::request_logs::Model>> {
    let finder = build_finder(&query);

    let total = match finder.clone().count(state.db.as_ref()).await {
        Ok(total) => total,
        Err(err) => return ProxyError::from(err).into(),
    };

    let limit = query.limit.clamp(1, 500);
    let page = query.page.max(1);
    let rows = match finder
        .order_by_desc(entity::request_logs::Column::Timestamp)
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

/// 导出请求日志为 CSV
pub async fn export_logs(
    State(state): State<ManagementState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let rows = match build_finder(&query)
        .order_by_desc(entity::request_logs::Column::Timestamp)
        .limit(10_000)
        .all(state.db.as_ref())
        .await
    {
        Ok(rows) => rows,
        Err(err) => return ProxyError::from(err).into_response(),
    };

    let mut csv = String::from(
        "id,timestamp,group_id,key_hash,model,is_success,status_code,request_path,duration_ms,request_type,error_message\n",
    );
    for row in rows {
        let error_message = row.error_message.replace(['\n', '\r'], " ").replace('"', "'");
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},\"{}\"\n",
            row.id,
            row.timestamp,
            row.group_id,
            row.key_hash,
            row.model,
            row.is_success,
            row.status_code,
            row.request_path,
            row.duration_ms,
            row.request_type,
            error_message,
        ));
    }

    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"request_logs.csv\"",
            ),
        ],
        csv,
    )
        .into_response()
}
