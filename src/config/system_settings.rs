//! # 系统设置管理器
//!
//! schema 驱动的可调参数：静态元数据表约束每个键的类型、下限
//! 和默认值；更新原子落库并通过发布订阅通知所有副本重载。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::Store;
use crate::{ldebug, lerror, linfo, lwarn};

/// 跨副本事件频道
pub const SYSTEM_EVENTS_CHANNEL: &str = "system:events";
/// 系统设置变更事件
pub const EVENT_SETTINGS_CHANGED: &str = "settings_changed";
/// 分组变更事件
pub const EVENT_GROUPS_CHANGED: &str = "groups_changed";
/// 密钥集合变更事件
pub const EVENT_KEYS_CHANGED: &str = "keys_changed";

/// 设置值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Int,
    Bool,
    Text,
}

/// 单个设置的元数据
#[derive(Debug, Clone, Copy)]
pub struct SettingMeta {
    pub key: &'static str,
    pub kind: SettingKind,
    /// 整型设置的下限
    pub min: Option<i64>,
    pub default: &'static str,
    pub description: &'static str,
}

/// 全部设置的元数据表
#[must_use]
pub const fn setting_metadata() -> &'static [SettingMeta] {
    &[
        SettingMeta {
            key: "request_timeout",
            kind: SettingKind::Int,
            min: Some(1),
            default: "600",
            description: "非流式请求超时时间（秒）",
        },
        SettingMeta {
            key: "max_retries",
            kind: SettingKind::Int,
            min: Some(0),
            default: "3",
            description: "单次请求跨密钥最大重试次数",
        },
        SettingMeta {
            key: "blacklist_threshold",
            kind: SettingKind::Int,
            min: Some(1),
            default: "3",
            description: "连续失败多少次后进入禁用",
        },
        SettingMeta {
            key: "key_validation_interval_minutes",
            kind: SettingKind::Int,
            min: Some(5),
            default: "60",
            description: "定时校验的分组间隔（分钟）",
        },
        SettingMeta {
            key: "key_validation_concurrency",
            kind: SettingKind::Int,
            min: Some(1),
            default: "10",
            description: "定时校验的并发数",
        },
        SettingMeta {
            key: "key_validation_timeout_seconds",
            kind: SettingKind::Int,
            min: Some(5),
            default: "20",
            description: "单个密钥探测请求超时（秒）",
        },
        SettingMeta {
            key: "max_concurrent_requests",
            kind: SettingKind::Int,
            min: Some(1),
            default: "100",
            description: "代理面最大并发请求数",
        },
        SettingMeta {
            key: "graceful_shutdown_timeout",
            kind: SettingKind::Int,
            min: Some(10),
            default: "10",
            description: "优雅停机等待时长（秒）",
        },
        SettingMeta {
            key: "enable_request_body_logging",
            kind: SettingKind::Bool,
            min: None,
            default: "false",
            description: "是否记录请求体到日志",
        },
        SettingMeta {
            key: "app_url",
            kind: SettingKind::Text,
            min: None,
            default: "http://localhost:3001",
            description: "服务对外地址",
        },
    ]
}

/// 系统设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub request_timeout: i64,
    pub max_retries: i64,
    pub blacklist_threshold: i64,
    pub key_validation_interval_minutes: i64,
    pub key_validation_concurrency: i64,
    pub key_validation_timeout_seconds: i64,
    pub max_concurrent_requests: i64,
    pub graceful_shutdown_timeout: i64,
    pub enable_request_body_logging: bool,
    pub app_url: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            request_timeout: 600,
            max_retries: 3,
            blacklist_threshold: 3,
            key_validation_interval_minutes: 60,
            key_validation_concurrency: 10,
            key_validation_timeout_seconds: 20,
            max_concurrent_requests: 100,
            graceful_shutdown_timeout: 10,
            enable_request_body_logging: false,
            app_url: "http://localhost:3001".to_string(),
        }
    }
}

impl SystemSettings {
    /// 应用单个键值，值来自设置表的字符串形态
    fn apply(&mut self, key: &str, raw: &str) {
        match key {
            "request_timeout" => apply_int(&mut self.request_timeout, raw),
            "max_retries" => apply_int(&mut self.max_retries, raw),
            "blacklist_threshold" => apply_int(&mut self.blacklist_threshold, raw),
            "key_validation_interval_minutes" => {
                apply_int(&mut self.key_validation_interval_minutes, raw);
            }
            "key_validation_concurrency" => apply_int(&mut self.key_validation_concurrency, raw),
            "key_validation_timeout_seconds" => {
                apply_int(&mut self.key_validation_timeout_seconds, raw);
            }
            "max_concurrent_requests" => apply_int(&mut self.max_concurrent_requests, raw),
            "graceful_shutdown_timeout" => apply_int(&mut self.graceful_shutdown_timeout, raw),
            "enable_request_body_logging" => {
                self.enable_request_body_logging = raw == "true";
            }
            "app_url" => self.app_url = raw.to_string(),
            _ => {}
        }
    }
}

fn apply_int(target: &mut i64, raw: &str) {
    if let Ok(parsed) = raw.parse::<i64>() {
        *target = parsed;
    }
}

/// 系统设置管理器
///
/// 进程内缓存由读写锁保护；写入方落库后发布变更事件，
/// 所有副本（包括自身）收到事件后从数据库重载。
pub struct SystemSettingsManager {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn Store>,
    settings: RwLock<SystemSettings>,
}

impl SystemSettingsManager {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>, store: Arc<dyn Store>) -> Self {
        Self {
            db,
            store,
            settings: RwLock::new(SystemSettings::default()),
        }
    }

    /// 初始化：主节点补齐缺失的默认行，然后加载缓存
    pub async fn initialize(&self, is_master: bool) -> Result<()> {
        if is_master {
            self.ensure_defaults().await?;
        }
        self.reload().await?;
        Ok(())
    }

    /// 当前系统设置的快照
    #[must_use]
    pub fn get_settings(&self) -> SystemSettings {
        self.settings.read().unwrap().clone()
    }

    /// 从数据库重载缓存
    pub async fn reload(&self) -> Result<()> {
        let rows = entity::system_settings::Entity::find()
            .all(self.db.as_ref())
            .await?;

        let mut settings = SystemSettings::default();
        for row in rows {
            settings.apply(&row.setting_key, &row.setting_value);
        }

        *self.settings.write().unwrap() = settings;
        ldebug!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "settings_reloaded",
            "System settings reloaded from database"
        );
        Ok(())
    }

    /// 校验一组待写入的设置
    ///
    /// 拒绝未知键、类型不符、非整数数值和低于下限的值。
    pub fn validate_settings(&self, updates: &HashMap<String, Value>) -> Result<()> {
        for (key, value) in updates {
            let Some(meta) = setting_metadata().iter().find(|m| m.key == key) else {
                return Err(ProxyError::validation(
                    format!("unknown setting key: {key}"),
                    Some(key.clone()),
                ));
            };

            match meta.kind {
                SettingKind::Int => {
                    let Some(number) = value.as_f64() else {
                        return Err(ProxyError::validation(
                            format!("setting {key} must be a number"),
                            Some(key.clone()),
                        ));
                    };
                    if number.fract() != 0.0 {
                        return Err(ProxyError::validation(
                            format!("setting {key} must be an integer"),
                            Some(key.clone()),
                        ));
                    }
                    if let Some(min) = meta.min {
                        if (number as i64) < min {
                            return Err(ProxyError::validation(
                                format!("setting {key} must be at least {min}"),
                                Some(key.clone()),
                            ));
                        }
                    }
                }
                SettingKind::Bool => {
                    if !value.is_boolean() {
                        return Err(ProxyError::validation(
                            format!("setting {key} must be a boolean"),
                            Some(key.clone()),
                        ));
                    }
                }
                SettingKind::Text => {
                    if !value.is_string() {
                        return Err(ProxyError::validation(
                            format!("setting {key} must be a string"),
                            Some(key.clone()),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// 原子更新设置并广播变更事件
    pub async fn update_settings(&self, updates: HashMap<String, Value>) -> Result<()> {
        self.validate_settings(&updates)?;

        let txn = self.db.begin().await?;
        let now = Utc::now().naive_utc();

        for (key, value) in &updates {
            let raw = canonical_value(value);
            let existing = entity::system_settings::Entity::find_by_id(key.clone())
                .one(&txn)
                .await?;

            match existing {
                Some(row) => {
                    let mut active: entity::system_settings::ActiveModel = row.into();
                    active.setting_value = Set(raw);
                    active.updated_at = Set(now);
                    active.update(&txn).await?;
                }
                None => {
                    let description = setting_metadata()
                        .iter()
                        .find(|m| m.key == key)
                        .map(|m| m.description.to_string())
                        .unwrap_or_default();
                    let active = entity::system_settings::ActiveModel {
                        setting_key: Set(key.clone()),
                        setting_value: Set(raw),
                        description: Set(description),
                        created_at: Set(now),
                        updated_at: Set(now),
                    };
                    active.insert(&txn).await?;
                }
            }
        }

        txn.commit().await?;
        self.reload().await?;

        if let Err(err) = self
            .store
            .publish(SYSTEM_EVENTS_CHANNEL, EVENT_SETTINGS_CHANGED.as_bytes())
            .await
        {
            lwarn!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "settings_publish_failed",
                "Failed to publish settings change event",
                error = %err
            );
        }

        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "settings_updated",
            "System settings updated",
            updated_keys = updates.len()
        );
        Ok(())
    }

    /// 计算分组生效配置：分组覆盖叠加在系统设置之上
    ///
    /// 分组配置无法合并时原样返回系统设置。
    #[must_use]
    pub fn get_effective_config(&self, group_config: &Value) -> SystemSettings {
        let settings = self.get_settings();

        let Some(overrides) = group_config.as_object() else {
            return settings;
        };
        if overrides.is_empty() {
            return settings;
        }

        let Ok(mut merged) = serde_json::to_value(&settings) else {
            return settings;
        };
        if let Some(base) = merged.as_object_mut() {
            for (key, value) in overrides {
                if base.contains_key(key) {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        serde_json::from_value(merged).unwrap_or(settings)
    }

    /// 启动跨副本变更监听
    ///
    /// 收到 `settings_changed` 事件后从数据库重载缓存。
    pub fn start_change_listener(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut subscription = match manager.store.subscribe(SYSTEM_EVENTS_CHANNEL).await {
                Ok(sub) => sub,
                Err(err) => {
                    lerror!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::Config,
                        "settings_subscribe_failed",
                        "Failed to subscribe to system events",
                        error = %err
                    );
                    return;
                }
            };

            while let Some(message) = subscription.recv().await {
                if message.payload == EVENT_SETTINGS_CHANGED.as_bytes() {
                    if let Err(err) = manager.reload().await {
                        lerror!(
                            "system",
                            LogStage::Configuration,
                            LogComponent::Config,
                            "settings_reload_failed",
                            "Failed to reload settings after change event",
                            error = %err
                        );
                    }
                }
            }
        });
    }

    /// 补齐缺失的默认设置行
    async fn ensure_defaults(&self) -> Result<()> {
        let now = Utc::now().naive_utc();
        for meta in setting_metadata() {
            let exists = entity::system_settings::Entity::find()
                .filter(entity::system_settings::Column::SettingKey.eq(meta.key))
                .one(self.db.as_ref())
                .await?;
            if exists.is_none() {
                let active = entity::system_settings::ActiveModel {
                    setting_key: Set(meta.key.to_string()),
                    setting_value: Set(meta.default.to_string()),
                    description: Set(meta.description.to_string()),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                active.insert(self.db.as_ref()).await?;
            }
        }
        Ok(())
    }
}

/// 设置值的规范字符串形态
fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            // 校验阶段已保证整数
            n.as_f64()
                .map(|f| format!("{}", f as i64))
                .unwrap_or_else(|| n.to_string())
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_without_db() -> SystemSettingsManager {
        // 校验和合并不触库，给一个未连接的句柄即可
        let db = Arc::new(DatabaseConnection::Disconnected);
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        SystemSettingsManager::new(db, store)
    }

    #[test]
    fn test_default_settings() {
        let settings = SystemSettings::default();
        assert_eq!(settings.request_timeout, 600);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.blacklist_threshold, 3);
    }

    #[test]
    fn test_validate_accepts_known_keys() {
        let manager = manager_without_db();
        let mut updates = HashMap::new();
        updates.insert("request_timeout".to_string(), json!(30));
        updates.insert("max_retries".to_string(), json!(5));
        updates.insert("enable_request_body_logging".to_string(), json!(true));
        updates.insert("app_url".to_string(), json!("http://example.com"));

        assert!(manager.validate_settings(&updates).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let manager = manager_without_db();
        let mut updates = HashMap::new();
        updates.insert("no_such_setting".to_string(), json!(1));

        let err = manager.validate_settings(&updates).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_validate_rejects_wrong_types() {
        let manager = manager_without_db();

        let mut updates = HashMap::new();
        updates.insert("request_timeout".to_string(), json!("sixty"));
        assert!(manager.validate_settings(&updates).is_err());

        let mut updates = HashMap::new();
        updates.insert("request_timeout".to_string(), json!(60.5));
        assert!(manager.validate_settings(&updates).is_err());

        let mut updates = HashMap::new();
        updates.insert("enable_request_body_logging".to_string(), json!("yes"));
        assert!(manager.validate_settings(&updates).is_err());
    }

    #[test]
    fn test_validate_rejects_below_min() {
        let manager = manager_without_db();
        let mut updates = HashMap::new();
        updates.insert("request_timeout".to_string(), json!(0));

        assert!(manager.validate_settings(&updates).is_err());
    }

    #[test]
    fn test_effective_config_overrides() {
        let manager = manager_without_db();

        let group_config = json!({
            "request_timeout": 60,
            "max_retries": 5,
        });
        let effective = manager.get_effective_config(&group_config);

        assert_eq!(effective.request_timeout, 60);
        assert_eq!(effective.max_retries, 5);
        // 其余字段保持系统设置
        assert_eq!(effective.blacklist_threshold, 3);
    }

    #[test]
    fn test_effective_config_empty_override() {
        let manager = manager_without_db();
        let effective = manager.get_effective_config(&json!({}));
        assert_eq!(effective, SystemSettings::default());
    }

    #[test]
    fn test_effective_config_bad_override_falls_back() {
        let manager = manager_without_db();
        // 类型不兼容的覆盖导致反序列化失败，回退系统设置
        let effective = manager.get_effective_config(&json!({"request_timeout": "not-a-number"}));
        assert_eq!(effective, SystemSettings::default());
    }

    #[test]
    fn test_effective_config_ignores_unknown_keys() {
        let manager = manager_without_db();
        let effective = manager.get_effective_config(&json!({"unknown_key": 42}));
        assert_eq!(effective, SystemSettings::default());
    }
}
