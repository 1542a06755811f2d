//! # 系统设置管理

use std::collections::HashMap;

use axum::extract::State;
use serde_json::{Value, json};

use crate::config::SystemSettings;
use crate::management::response::ApiResponse;
use crate::management::state::ManagementState;

/// 当前系统设置
pub async fn get_settings(State(state): State<ManagementState>) -> ApiResponse<SystemSettings> {
    ApiResponse::Success(state.settings.get_settings())
}

/// 更新系统设置并广播变更
pub async fn update_settings(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<HashMap<String, Value>>,
) -> ApiResponse<Value> {
    match state.settings.update_settings(payload).await {
        Ok(()) => ApiResponse::SuccessWithMessage(
            json!({"settings": state.settings.get_settings()}),
            "settings updated".to_string(),
        ),
        Err(err) => err.into(),
    }
}
