//! # 错误处理模块
//!
//! 统一的错误类型定义和上游错误解析

mod parser;
mod types;

pub use parser::{is_ignorable_message, is_uncounted, parse_upstream_error};
pub use types::{ErrorCategory, ProxyError};

/// 应用结果类型
pub type Result<T> = std::result::Result<T, ProxyError>;

/// 错误上下文扩展trait
pub trait ErrorContext<T> {
    /// 添加数据库错误上下文
    fn with_database_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// 添加存储错误上下文
    fn with_store_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// 添加内部错误上下文
    fn with_internal_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn with_database_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ProxyError::database_with_source(f(), e.into()))
    }

    fn with_store_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ProxyError::store_with_source(f(), e.into()))
    }

    fn with_internal_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ProxyError::internal_with_source(f(), e.into()))
    }
}
