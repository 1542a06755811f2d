//! # 管理端认证中间件
//!
//! 所有受保护路由要求 `Authorization: Bearer <AUTH_KEY>`。

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::state::ManagementState;
use crate::error::ProxyError;

/// 校验管理端凭证
pub async fn require_auth(
    State(state): State<ManagementState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == state.config.auth_key);

    if !authorized {
        return ProxyError::auth("invalid management credential").into_response();
    }

    next.run(request).await
}
