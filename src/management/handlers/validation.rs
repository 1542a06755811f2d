//! # 校验控制面
//!
//! 增量校验的触发接口。单分组 10 分钟、全量 30 分钟的
//! 硬性截止时间；同一时间只允许一个校验任务。

use std::time::Duration;

use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::keypool::{
    IncrementalValidationConfig, IncrementalValidationResult, KeyStatus,
};
use crate::management::response::ApiResponse;
use crate::management::state::ManagementState;

/// 单分组校验的截止时间
const SINGLE_GROUP_DEADLINE: Duration = Duration::from_secs(10 * 60);
/// 全量校验的截止时间
const ALL_GROUPS_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// 增量校验配置的请求体
#[derive(Debug, Default, Deserialize)]
pub struct ValidationConfigRequest {
    #[serde(default)]
    pub time_window_hours: Option<i64>,
    #[serde(default)]
    pub include_states: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_recently_validated: Option<bool>,
    #[serde(default)]
    pub recent_validation_window_minutes: Option<i64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<u64>,
}

impl ValidationConfigRequest {
    fn into_config(self) -> Result<IncrementalValidationConfig, ProxyError> {
        let mut config = IncrementalValidationConfig::default();

        if let Some(hours) = self.time_window_hours {
            config.time_window = chrono::Duration::hours(hours);
        }
        if let Some(states) = self.include_states {
            let mut parsed = Vec::with_capacity(states.len());
            for raw in states {
                let status = KeyStatus::parse(&raw).ok_or_else(|| {
                    ProxyError::validation(
                        format!("invalid status: {raw}"),
                        Some("include_states".to_string()),
                    )
                })?;
                parsed.push(status);
            }
            config.include_states = parsed;
        }
        if let Some(exclude) = self.exclude_recently_validated {
            config.exclude_recently_validated = exclude;
        }
        if let Some(minutes) = self.recent_validation_window_minutes {
            config.recent_validation_window = chrono::Duration::minutes(minutes);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }

        Ok(config.normalized())
    }
}

/// 截止时间到达后自动取消的令牌
fn deadline_token(deadline: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        trigger.cancel();
    });
    token
}

/// 校验单个分组
pub async fn validate_group(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
    axum::Json(payload): axum::Json<ValidationConfigRequest>,
) -> ApiResponse<IncrementalValidationResult> {
    let Ok(_guard) = state.validation_lock.try_lock() else {
        return ProxyError::task_in_progress("a validation task is already running").into();
    };

    let config = match payload.into_config() {
        Ok(config) => config,
        Err(err) => return err.into(),
    };

    let cancel = deadline_token(SINGLE_GROUP_DEADLINE);
    match state
        .incremental
        .validate_group(&cancel, group_id, config)
        .await
    {
        Ok(result) => ApiResponse::Success(result),
        Err(err) => err.into(),
    }
}

/// 校验全部分组
pub async fn validate_all_groups(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<ValidationConfigRequest>,
) -> ApiResponse<Vec<IncrementalValidationResult>> {
    let Ok(_guard) = state.validation_lock.try_lock() else {
        return ProxyError::task_in_progress("a validation task is already running").into();
    };

    let config = match payload.into_config() {
        Ok(config) => config,
        Err(err) => return err.into(),
    };

    let cancel = deadline_token(ALL_GROUPS_DEADLINE);
    match state
        .incremental
        .validate_all_groups(&cancel, config)
        .await
    {
        Ok(results) => ApiResponse::Success(results),
        Err(err) => err.into(),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_hours")]
    pub hours: i64,
}

fn default_history_hours() -> i64 {
    24
}

/// 分组的校验历史概览
pub async fn validation_history(
    State(state): State<ManagementState>,
    Path(group_id): Path<i32>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse<Value> {
    match state
        .incremental
        .get_validation_history(group_id, chrono::Duration::hours(query.hours.max(1)))
        .await
    {
        Ok(history) => ApiResponse::Success(history),
        Err(err) => err.into(),
    }
}
