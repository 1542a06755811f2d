//! # 管理端处理器

pub mod auth;
pub mod dashboard;
pub mod groups;
pub mod keys;
pub mod logs;
pub mod settings;
pub mod validation;
