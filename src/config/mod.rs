//! # 配置模块
//!
//! 进程级环境配置与运行时系统设置

mod app_config;
mod system_settings;

pub use app_config::{AppConfig, CorsConfig, ServerConfig};
pub use system_settings::{
    EVENT_GROUPS_CHANGED, EVENT_KEYS_CHANGED, EVENT_SETTINGS_CHANGED, SYSTEM_EVENTS_CHANNEL,
    SettingKind, SettingMeta, SystemSettings, SystemSettingsManager, setting_metadata,
};
