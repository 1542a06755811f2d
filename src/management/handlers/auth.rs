//! # 管理端认证

use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::management::response::ApiResponse;
use crate::management::state::ManagementState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub auth_key: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

/// 用管理凭证换取会话令牌
pub async fn login(
    State(state): State<ManagementState>,
    axum::Json(payload): axum::Json<LoginRequest>,
) -> ApiResponse<LoginResponse> {
    if payload.auth_key != state.config.auth_key {
        return ProxyError::auth("invalid auth key").into();
    }
    ApiResponse::Success(LoginResponse {
        token: state.config.auth_key.clone(),
    })
}
