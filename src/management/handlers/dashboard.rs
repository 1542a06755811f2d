//! # 仪表盘

use axum::extract::State;
use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{Value, json};

use crate::error::ProxyError;
use crate::keypool::KeyStatus;
use crate::management::response::ApiResponse;
use crate::management::state::ManagementState;

/// 概览计数：分组数、密钥状态分布、近 24 小时请求量
pub async fn overview(State(state): State<ManagementState>) -> ApiResponse<Value> {
    let group_count = match entity::groups::Entity::find().count(state.db.as_ref()).await {
        Ok(count) => count,
        Err(err) => return ProxyError::from(err).into(),
    };

    let mut keys_by_status = serde_json::Map::new();
    for status in KeyStatus::all() {
        match entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::Status.eq(status.as_str()))
            .count(state.db.as_ref())
            .await
        {
            Ok(count) => {
                keys_by_status.insert(status.as_str().to_string(), count.into());
            }
            Err(err) => return ProxyError::from(err).into(),
        }
    }

    let day_ago = Utc::now().naive_utc() - Duration::hours(24);
    let recent = entity::request_logs::Entity::find()
        .filter(entity::request_logs::Column::Timestamp.gte(day_ago))
        .filter(entity::request_logs::Column::RequestType.eq("final"));

    let (total_requests, failed_requests) = {
        let total = match recent.clone().count(state.db.as_ref()).await {
            Ok(count) => count,
            Err(err) => return ProxyError::from(err).into(),
        };
        let failed = match recent
            .clone()
            .filter(entity::request_logs::Column::IsSuccess.eq(false))
            .count(state.db.as_ref())
            .await
        {
            Ok(count) => count,
            Err(err) => return ProxyError::from(err).into(),
        };
        (total, failed)
    };

    ApiResponse::Success(json!({
        "groups": group_count,
        "keys_by_status": keys_by_status,
        "requests_24h": {
            "total": total_requests,
            "failed": failed_requests,
            "successful": total_requests - failed_requests,
        },
    }))
}
