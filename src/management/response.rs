//! # API 响应结构
//!
//! 统一的 JSON 响应信封：成功、分页、失败共用一个出口。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ProxyError;

/// 分页信息
#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub pages: u64,
}

impl Pagination {
    #[must_use]
    pub fn new(page: u64, limit: u64, total: u64) -> Self {
        let limit = limit.max(1);
        Self {
            page,
            limit,
            total,
            pages: total.div_ceil(limit),
        }
    }
}

/// 标准成功响应
#[derive(Debug, Serialize)]
struct SuccessBody<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pagination: Option<Pagination>,
    timestamp: DateTime<Utc>,
}

/// API 响应枚举，统一转换为 `axum::response::Response`
pub enum ApiResponse<T: Serialize> {
    Success(T),
    SuccessWithMessage(T, String),
    Paginated(T, Pagination),
    Error(ProxyError),
}

impl<T: Serialize> ApiResponse<T> {
    fn success_body(
        data: Option<T>,
        message: Option<String>,
        pagination: Option<Pagination>,
    ) -> Response {
        let body = SuccessBody {
            success: true,
            data,
            message,
            pagination,
            timestamp: Utc::now(),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            Self::Success(data) => Self::success_body(Some(data), None, None),
            Self::SuccessWithMessage(data, message) => {
                Self::success_body(Some(data), Some(message), None)
            }
            Self::Paginated(data, pagination) => {
                Self::success_body(Some(data), None, Some(pagination))
            }
            Self::Error(err) => err.into_response(),
        }
    }
}

impl<T: Serialize> From<ProxyError> for ApiResponse<T> {
    fn from(err: ProxyError) -> Self {
        Self::Error(err)
    }
}
