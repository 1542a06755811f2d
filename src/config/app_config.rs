//! # 进程级应用配置
//!
//! 从环境变量加载服务器配置，非法配置在启动阶段直接失败

use std::env;

use crate::error::{ProxyError, Result};

/// 优雅停机时长下限（秒），低于此值静默抬升
const MIN_GRACEFUL_SHUTDOWN_TIMEOUT: u64 = 10;

/// 服务器监听配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// CORS 配置
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
}

/// 应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// 管理端认证密钥
    pub auth_key: String,
    /// 从节点模式：不跑迁移、不启动定时校验
    pub is_slave: bool,
    pub log_level: Option<String>,
    pub cors: CorsConfig,
    /// 为空时使用进程内存储
    pub redis_dsn: String,
    /// 为空时密钥明文落库
    pub encryption_key: String,
    pub database_dsn: String,
    pub max_concurrent_requests: usize,
    /// 优雅停机时长（秒）
    pub graceful_shutdown_timeout: u64,
}

impl AppConfig {
    /// 从环境变量加载配置
    ///
    /// 启动失败条件：缺少 `AUTH_KEY`、端口不在 1–65535、
    /// `MAX_CONCURRENT_REQUESTS` 小于 1、开启 CORS 但未配置来源。
    pub fn from_env() -> Result<Self> {
        let auth_key = env::var("AUTH_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProxyError::config("AUTH_KEY is required"))?;

        let port = match env::var("PORT") {
            Ok(raw) => {
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| ProxyError::config(format!("invalid PORT: {raw}")))?;
                if !(1..=65535).contains(&parsed) {
                    return Err(ProxyError::config(format!(
                        "PORT must be between 1 and 65535, got {parsed}"
                    )));
                }
                parsed as u16
            }
            Err(_) => 3001,
        };

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let max_concurrent_requests = match env::var("MAX_CONCURRENT_REQUESTS") {
            Ok(raw) => {
                let parsed: i64 = raw.parse().map_err(|_| {
                    ProxyError::config(format!("invalid MAX_CONCURRENT_REQUESTS: {raw}"))
                })?;
                if parsed < 1 {
                    return Err(ProxyError::config(
                        "MAX_CONCURRENT_REQUESTS must be at least 1",
                    ));
                }
                parsed as usize
            }
            Err(_) => 100,
        };

        let cors_enabled = parse_bool_env("ENABLE_CORS");
        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if cors_enabled && allowed_origins.is_empty() {
            return Err(ProxyError::config(
                "ALLOWED_ORIGINS is required when CORS is enabled",
            ));
        }

        let graceful_shutdown_timeout = env::var("GRACEFUL_SHUTDOWN_TIMEOUT")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(MIN_GRACEFUL_SHUTDOWN_TIMEOUT)
            .max(MIN_GRACEFUL_SHUTDOWN_TIMEOUT);

        Ok(Self {
            server: ServerConfig { host, port },
            auth_key,
            is_slave: parse_bool_env("IS_SLAVE"),
            log_level: env::var("LOG_LEVEL").ok(),
            cors: CorsConfig {
                enabled: cors_enabled,
                allowed_origins,
            },
            redis_dsn: env::var("REDIS_DSN").unwrap_or_default(),
            encryption_key: env::var("ENCRYPTION_KEY").unwrap_or_default(),
            database_dsn: env::var("DATABASE_DSN")
                .unwrap_or_else(|_| "sqlite://data/keyproxy.db?mode=rwc".to_string()),
            max_concurrent_requests,
            graceful_shutdown_timeout,
        })
    }

    /// 监听地址
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "AUTH_KEY",
            "PORT",
            "HOST",
            "IS_SLAVE",
            "ENABLE_CORS",
            "ALLOWED_ORIGINS",
            "MAX_CONCURRENT_REQUESTS",
            "GRACEFUL_SHUTDOWN_TIMEOUT",
        ] {
            unsafe { env::remove_var(name) };
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_auth_key() {
        clear_env();
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("AUTH_KEY"));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        unsafe { env::set_var("AUTH_KEY", "test-auth-key") };

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(!config.is_slave);
        assert_eq!(config.max_concurrent_requests, 100);
        assert_eq!(config.graceful_shutdown_timeout, 10);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_port_rejected() {
        clear_env();
        unsafe {
            env::set_var("AUTH_KEY", "test-auth-key");
            env::set_var("PORT", "70000");
        }

        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_cors_requires_origins() {
        clear_env();
        unsafe {
            env::set_var("AUTH_KEY", "test-auth-key");
            env::set_var("ENABLE_CORS", "true");
        }

        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_graceful_shutdown_floor() {
        clear_env();
        unsafe {
            env::set_var("AUTH_KEY", "test-auth-key");
            env::set_var("GRACEFUL_SHUTDOWN_TIMEOUT", "3");
        }

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.graceful_shutdown_timeout, 10);
        clear_env();
    }
}
