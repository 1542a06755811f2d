//! # 统一日志工具模块
//!
//! 提供完整的日志工具链：
//! - 结构化业务日志宏（请求链路专用）
//! - 日志系统初始化和配置
//! - 敏感信息脱敏辅助函数

use std::env;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志阶段枚举
#[derive(Debug, Clone, Copy)]
pub enum LogStage {
    RequestStart,
    Authentication,
    RequestModify,
    UpstreamRequest,
    Response,
    ResponseFailure,
    Error,
    Startup,
    Shutdown,
    Configuration,
    KeyValidation,
    BackgroundTask,
    Scheduling,
    Store,
    Db,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequestStart => "request_start",
            Self::Authentication => "authentication",
            Self::RequestModify => "request_modify",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::Error => "error",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::KeyValidation => "key_validation",
            Self::BackgroundTask => "background_task",
            Self::Scheduling => "scheduling",
            Self::Store => "store",
            Self::Db => "db",
        }
    }
}

/// 组件枚举
#[derive(Debug, Clone, Copy)]
pub enum LogComponent {
    Main,
    ServerSetup,
    Config,
    Database,
    Store,
    Proxy,
    Executor,
    Auth,
    KeyPool,
    KeyState,
    PolicyEngine,
    PolicyHandler,
    Validator,
    CronChecker,
    GroupManager,
    Channel,
    Management,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::ServerSetup => "server_setup",
            Self::Config => "config",
            Self::Database => "database",
            Self::Store => "store",
            Self::Proxy => "proxy",
            Self::Executor => "executor",
            Self::Auth => "auth",
            Self::KeyPool => "key_pool",
            Self::KeyState => "key_state",
            Self::PolicyEngine => "policy_engine",
            Self::PolicyHandler => "policy_handler",
            Self::Validator => "validator",
            Self::CronChecker => "cron_checker",
            Self::GroupManager => "group_manager",
            Self::Channel => "channel",
            Self::Management => "management",
        }
    }
}

/// 标准日志宏 - 信息级别
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 标准日志宏 - 调试级别
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 标准日志宏 - 警告级别
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 标准日志宏 - 错误级别
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 脱敏API密钥
#[must_use]
pub fn sanitize_api_key(api_key: &str) -> String {
    if api_key.len() > 8 {
        format!(
            "{}...{}",
            &api_key[..4],
            &api_key[api_key.len().saturating_sub(4)..]
        )
    } else if !api_key.is_empty() {
        "***".to_string()
    } else {
        "<empty>".to_string()
    }
}

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 默认日志级别
    pub default_level: String,
    /// 应用程序日志级别
    pub app_level: String,
    /// Sea ORM 查询日志级别
    pub sea_orm_level: String,
    /// `SQLx` 通用日志级别
    pub sqlx_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            app_level: "debug".to_string(),
            sea_orm_level: "warn".to_string(),
            sqlx_level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    /// 创建生产环境配置
    #[must_use]
    pub fn production() -> Self {
        Self {
            default_level: "info".to_string(),
            app_level: "info".to_string(),
            sea_orm_level: "warn".to_string(),
            sqlx_level: "warn".to_string(),
        }
    }

    /// 创建开发环境配置
    #[must_use]
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            app_level: "trace".to_string(),
            sea_orm_level: "debug".to_string(),
            sqlx_level: "debug".to_string(),
        }
    }

    /// 创建测试环境配置
    #[must_use]
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            app_level: "debug".to_string(),
            sea_orm_level: "off".to_string(),
            sqlx_level: "warn".to_string(),
        }
    }

    /// 构建日志过滤器字符串
    #[must_use]
    pub fn build_filter(&self) -> String {
        format!(
            "{},keyproxy={},sea_orm::query={},sqlx={}",
            self.default_level, self.app_level, self.sea_orm_level, self.sqlx_level
        )
    }

    /// 从环境变量创建配置
    ///
    /// 支持通过 `LOG_MODE` 环境变量选择预设模式：
    /// - "production": 生产环境（性能优先，关闭数据库查询日志）
    /// - "development": 开发环境（详细日志，启用数据库查询）
    /// - "testing": 测试环境（最小日志）
    /// - 未设置时默认使用 "production"
    #[must_use]
    pub fn from_env() -> Self {
        match env::var("LOG_MODE").ok().as_deref() {
            Some("development") => Self::development(),
            Some("testing") => Self::testing(),
            _ => Self::production(),
        }
    }
}

/// 初始化日志系统
pub fn init_logging(log_level: Option<&String>) {
    let config = LoggingConfig::from_env();

    // 如果有传入的日志级别，覆盖默认级别
    let final_config = if let Some(level) = log_level {
        let mut config = config;
        config.default_level.clone_from(level);
        config
    } else {
        config
    };

    let filter_string = final_config.build_filter();

    // RUST_LOG 覆盖构建出的过滤器
    let log_filter = env::var("RUST_LOG").unwrap_or(filter_string);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::default())
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(tracing_subscriber::filter::FilterFn::new(|metadata| {
            // 过滤掉一些噪音日志
            !metadata.target().starts_with("hyper::")
                && !metadata.target().starts_with("h2::client")
                && !metadata.target().starts_with("tokio::runtime")
        }));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "log_init",
        &format!("日志系统已启动 | 过滤器: {log_filter}")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_api_key() {
        assert_eq!(sanitize_api_key("sk-1234567890abcdef"), "sk-1...cdef");
        assert_eq!(sanitize_api_key("short"), "***");
        assert_eq!(sanitize_api_key(""), "<empty>");
    }

    #[test]
    fn test_build_filter() {
        let config = LoggingConfig::production();
        let filter = config.build_filter();
        assert!(filter.contains("keyproxy=info"));
        assert!(filter.starts_with("info,"));
    }
}
