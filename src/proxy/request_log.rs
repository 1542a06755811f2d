//! # 请求日志服务
//!
//! 每次上游尝试落一条追加式记录。写入在后台完成，
//! 失败只记日志，绝不拖累用户请求。

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection};

use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 重试中间记录
pub const REQUEST_TYPE_RETRY: &str = "retry";
/// 最终结果记录
pub const REQUEST_TYPE_FINAL: &str = "final";

/// 待写入的日志条目
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub group_id: i32,
    pub key_hash: String,
    pub model: String,
    pub is_success: bool,
    pub status_code: i32,
    pub request_path: String,
    pub duration_ms: i64,
    pub error_message: String,
    /// retry / final
    pub request_type: &'static str,
}

/// 请求日志服务
pub struct RequestLogService {
    db: Arc<DatabaseConnection>,
}

impl RequestLogService {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 异步写入一条记录
    pub fn record(self: &Arc<Self>, entry: RequestLogEntry) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let now = Utc::now().naive_utc();
            let active = entity::request_logs::ActiveModel {
                timestamp: Set(now),
                group_id: Set(entry.group_id),
                key_hash: Set(entry.key_hash),
                model: Set(entry.model),
                is_success: Set(entry.is_success),
                status_code: Set(entry.status_code),
                request_path: Set(entry.request_path),
                duration_ms: Set(entry.duration_ms),
                error_message: Set(entry.error_message),
                request_type: Set(entry.request_type.to_string()),
                created_at: Set(now),
                ..Default::default()
            };

            if let Err(err) = active.insert(service.db.as_ref()).await {
                lwarn!(
                    "system",
                    LogStage::Db,
                    LogComponent::Proxy,
                    "request_log_write_failed",
                    "Failed to write request log",
                    error = %err
                );
            }
        });
    }
}
