//! # 错误类型定义

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据库相关错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 共享存储错误
    #[error("存储错误: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 存储键不存在
    #[error("存储键不存在: {key}")]
    StoreNotFound { key: String },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 认证错误
    #[error("认证错误: {message}")]
    Auth { message: String },

    /// 权限错误
    #[error("权限错误: {message}")]
    Forbidden { message: String },

    /// 输入校验错误
    #[error("校验错误: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// 资源未找到
    #[error("资源未找到: {resource_type} {identifier}")]
    NotFound {
        resource_type: String,
        identifier: String,
    },

    /// 资源冲突
    #[error("资源冲突: {resource_type} {identifier}")]
    Conflict {
        resource_type: String,
        identifier: String,
    },

    /// 上游返回的错误，状态码透传
    #[error("上游错误 ({status_code}): {message}")]
    Upstream { status_code: u16, message: String },

    /// 分组内没有可用密钥
    #[error("没有可用密钥: {message}")]
    NoActiveKeys { message: String },

    /// 所有密钥重试耗尽
    #[error("重试次数耗尽: {message}")]
    MaxRetriesExceeded { message: String },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 任务已在进行中
    #[error("任务进行中: {message}")]
    TaskInProgress { message: String },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// 错误归属：客户端问题还是服务端问题，决定日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Client,
    Server,
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误代码
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Database { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            Self::Store { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            Self::StoreNotFound { .. } => (StatusCode::NOT_FOUND, "STORE_NOT_FOUND"),
            Self::Network { .. } => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            Self::Auth { .. } => (StatusCode::UNAUTHORIZED, "AUTH_ERROR"),
            Self::Forbidden { .. } => (StatusCode::FORBIDDEN, "PERMISSION_ERROR"),
            Self::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND"),
            Self::Conflict { .. } | Self::TaskInProgress { .. } => {
                (StatusCode::CONFLICT, "RESOURCE_CONFLICT")
            }
            Self::Upstream { status_code, .. } => (
                StatusCode::from_u16(*status_code).unwrap_or(StatusCode::BAD_GATEWAY),
                "UPSTREAM_ERROR",
            ),
            Self::NoActiveKeys { .. } => (StatusCode::SERVICE_UNAVAILABLE, "NO_KEYS_AVAILABLE"),
            Self::MaxRetriesExceeded { .. } => (StatusCode::BAD_GATEWAY, "MAX_RETRIES_EXCEEDED"),
            Self::Serialization { .. } => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// HTTP 状态码
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.to_http_response_parts().0
    }

    /// 稳定的错误代码，测试和日志以此为准
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        self.to_http_response_parts().1
    }

    /// 错误归属分类
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        if self.status_code().is_client_error() {
            ErrorCategory::Client
        } else {
            ErrorCategory::Server
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建数据库错误
    pub fn database<T: Into<String>>(message: T) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的数据库错误
    pub fn database_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建存储错误
    pub fn store<T: Into<String>>(message: T) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的存储错误
    pub fn store_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建存储键不存在错误
    pub fn store_not_found<T: Into<String>>(key: T) -> Self {
        Self::StoreNotFound { key: key.into() }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// 创建权限错误
    pub fn forbidden<T: Into<String>>(message: T) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// 创建校验错误
    pub fn validation<T: Into<String>>(message: T, field: Option<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field,
        }
    }

    /// 创建资源未找到错误
    pub fn not_found<T: Into<String>, I: Into<String>>(resource_type: T, identifier: I) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// 创建资源冲突错误
    pub fn conflict<T: Into<String>, I: Into<String>>(resource_type: T, identifier: I) -> Self {
        Self::Conflict {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// 创建上游错误
    pub fn upstream<T: Into<String>>(status_code: u16, message: T) -> Self {
        Self::Upstream {
            status_code,
            message: message.into(),
        }
    }

    /// 创建无可用密钥错误
    pub fn no_active_keys<T: Into<String>>(message: T) -> Self {
        Self::NoActiveKeys {
            message: message.into(),
        }
    }

    /// 创建重试耗尽错误
    pub fn max_retries_exceeded<T: Into<String>>(message: T) -> Self {
        Self::MaxRetriesExceeded {
            message: message.into(),
        }
    }

    /// 创建任务进行中错误
    pub fn task_in_progress<T: Into<String>>(message: T) -> Self {
        Self::TaskInProgress {
            message: message.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

// 等价性按错误代码比较，而不是按内容或指针
impl PartialEq for ProxyError {
    fn eq(&self, other: &Self) -> bool {
        self.error_code() == other.error_code() && self.status_code() == other.status_code()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.to_http_response_parts();
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

// 自动转换常见错误类型
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::internal_with_source("IO操作失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<sea_orm::error::DbErr> for ProxyError {
    fn from(err: sea_orm::error::DbErr) -> Self {
        Self::database_with_source("数据库操作失败", err)
    }
}

impl From<redis::RedisError> for ProxyError {
    fn from(err: redis::RedisError) -> Self {
        Self::store_with_source("Redis操作失败", err)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        Self::network_with_source("HTTP请求失败", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_response_parts() {
        assert_eq!(
            ProxyError::no_active_keys("empty pool").to_http_response_parts(),
            (StatusCode::SERVICE_UNAVAILABLE, "NO_KEYS_AVAILABLE")
        );
        assert_eq!(
            ProxyError::auth("bad token").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::upstream(429, "rate limited").status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::upstream(999, "weird").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_equality_compares_by_code() {
        let a = ProxyError::no_active_keys("group alpha");
        let b = ProxyError::no_active_keys("group beta");
        assert_eq!(a, b);

        let c = ProxyError::internal("boom");
        assert_ne!(a, c);
    }

    #[test]
    fn test_category() {
        assert_eq!(
            ProxyError::validation("bad", None).category(),
            ErrorCategory::Client
        );
        assert_eq!(ProxyError::internal("x").category(), ErrorCategory::Server);
    }
}
