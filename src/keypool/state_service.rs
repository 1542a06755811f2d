//! # 密钥状态服务
//!
//! 在状态机之上做持久化：所有转换在数据库事务内完成，
//! 影响轮转资格的变更同步到共享存储的轮转列表。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait, TransactionTrait};

use super::state_machine::{KeyStatus, backoff_duration, transition};
use super::store_keys::{active_keys_key, key_detail_key};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::Store;
use crate::{ldebug, linfo, lwarn};

/// 手动禁用的固定时长（分钟）
const MANUAL_DISABLE_MINUTES: i64 = 30;

/// 一次状态变更的摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub key_id: i64,
    pub group_id: i32,
    pub old_status: KeyStatus,
    pub new_status: KeyStatus,
}

/// 密钥状态服务
pub struct KeyStateService {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn Store>,
}

impl KeyStateService {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>, store: Arc<dyn Store>) -> Self {
        Self { db, store }
    }

    /// 处理密钥成功
    ///
    /// 成功后连续失败、退避级别、禁用时间和错误信息全部清零。
    pub async fn handle_success(&self, key_id: i64) -> Result<StatusChange> {
        let txn = self.db.begin().await?;

        let key = entity::api_keys::Entity::find_by_id(key_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ProxyError::not_found("api_key", key_id.to_string()))?;

        let old_status = KeyStatus::parse(&key.status).unwrap_or(KeyStatus::Pending);
        let new_status = transition(old_status, true, key.consecutive_failures);
        let group_id = key.group_id;
        let now = Utc::now().naive_utc();

        let mut active: entity::api_keys::ActiveModel = key.into();
        active.status = Set(new_status.as_str().to_string());
        active.last_success_at = Set(Some(now));
        active.consecutive_failures = Set(0);
        active.backoff_level = Set(0);
        active.disabled_until = Set(None);
        active.last_error_message = Set(String::new());
        active.updated_at = Set(now);
        active.update(&txn).await?;

        txn.commit().await?;

        let change = StatusChange {
            key_id,
            group_id,
            old_status,
            new_status,
        };
        self.sync_rotation(change).await;

        ldebug!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyState,
            "key_success_handled",
            "Key status updated after success",
            key_id = key_id,
            old_status = old_status.as_str(),
            new_status = new_status.as_str()
        );

        Ok(change)
    }

    /// 处理密钥失败
    ///
    /// 递增连续失败次数后走状态机；进入禁用时抬升退避级别
    /// 并写入解禁时间。
    pub async fn handle_failure(&self, key_id: i64, error_message: &str) -> Result<StatusChange> {
        let txn = self.db.begin().await?;

        let key = entity::api_keys::Entity::find_by_id(key_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ProxyError::not_found("api_key", key_id.to_string()))?;

        let old_status = KeyStatus::parse(&key.status).unwrap_or(KeyStatus::Pending);
        let consecutive_failures = key.consecutive_failures + 1;
        let new_status = transition(old_status, false, consecutive_failures);
        let group_id = key.group_id;
        let old_backoff_level = key.backoff_level;
        let now = Utc::now().naive_utc();

        let mut active: entity::api_keys::ActiveModel = key.into();
        active.status = Set(new_status.as_str().to_string());
        active.last_failure_at = Set(Some(now));
        active.consecutive_failures = Set(consecutive_failures);
        active.last_error_message = Set(error_message.to_string());
        active.updated_at = Set(now);

        if new_status == KeyStatus::Disabled {
            let backoff_level = old_backoff_level + 1;
            active.backoff_level = Set(backoff_level);
            active.disabled_until = Set(Some(now + backoff_duration(backoff_level)));
        }

        active.update(&txn).await?;
        txn.commit().await?;

        let change = StatusChange {
            key_id,
            group_id,
            old_status,
            new_status,
        };
        self.sync_rotation(change).await;

        ldebug!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyState,
            "key_failure_handled",
            "Key status updated after failure",
            key_id = key_id,
            old_status = old_status.as_str(),
            new_status = new_status.as_str(),
            consecutive_failures = consecutive_failures,
            error_message = %error_message
        );

        Ok(change)
    }

    /// 手动将密钥标记为无效
    pub async fn manually_invalidate_key(&self, key_id: i64, reason: &str) -> Result<StatusChange> {
        let now = Utc::now().naive_utc();
        let change = self
            .apply_manual_update(key_id, KeyStatus::Invalid, |active| {
                active.last_error_message = Set(format!("Manually invalidated: {reason}"));
                active.last_failure_at = Set(Some(now));
            })
            .await?;

        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyState,
            "key_invalidated",
            "Key manually invalidated",
            key_id = key_id,
            reason = %reason
        );
        Ok(change)
    }

    /// 手动禁用密钥，固定 30 分钟
    pub async fn manually_disable_key(&self, key_id: i64, reason: &str) -> Result<StatusChange> {
        self.manually_disable_key_for(
            key_id,
            reason,
            chrono::Duration::minutes(MANUAL_DISABLE_MINUTES),
        )
        .await
    }

    /// 按指定时长禁用密钥
    pub async fn manually_disable_key_for(
        &self,
        key_id: i64,
        reason: &str,
        duration: chrono::Duration,
    ) -> Result<StatusChange> {
        let now = Utc::now().naive_utc();
        let disabled_until = now + duration;
        let change = self
            .apply_manual_update(key_id, KeyStatus::Disabled, |active| {
                active.disabled_until = Set(Some(disabled_until));
                active.last_error_message = Set(format!("Manually disabled: {reason}"));
                active.last_failure_at = Set(Some(now));
            })
            .await?;

        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyState,
            "key_disabled",
            "Key manually disabled",
            key_id = key_id,
            reason = %reason,
            disabled_until = %disabled_until
        );
        Ok(change)
    }

    /// 手动启用密钥
    ///
    /// 置为降级而不是活跃：需要真实成功后才能重新晋升。
    pub async fn manually_enable_key(&self, key_id: i64) -> Result<StatusChange> {
        let change = self
            .apply_manual_update(key_id, KeyStatus::Degraded, |active| {
                active.disabled_until = Set(None);
                active.consecutive_failures = Set(0);
                active.backoff_level = Set(0);
                active.last_error_message = Set(String::new());
            })
            .await?;

        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyState,
            "key_enabled",
            "Key manually enabled",
            key_id = key_id
        );
        Ok(change)
    }

    /// 直接写入状态，仅校验状态名合法
    pub async fn update_key_status(&self, key_id: i64, new_status: &str) -> Result<StatusChange> {
        let status = KeyStatus::parse(new_status)
            .ok_or_else(|| ProxyError::validation(format!("invalid status: {new_status}"), None))?;
        self.apply_manual_update(key_id, status, |_| {}).await
    }

    /// 加载密钥、应用手动变更并同步轮转列表
    async fn apply_manual_update<F>(
        &self,
        key_id: i64,
        new_status: KeyStatus,
        mutate: F,
    ) -> Result<StatusChange>
    where
        F: FnOnce(&mut entity::api_keys::ActiveModel),
    {
        let txn = self.db.begin().await?;

        let key = entity::api_keys::Entity::find_by_id(key_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ProxyError::not_found("api_key", key_id.to_string()))?;

        let old_status = KeyStatus::parse(&key.status).unwrap_or(KeyStatus::Pending);
        let group_id = key.group_id;

        let mut active: entity::api_keys::ActiveModel = key.into();
        active.status = Set(new_status.as_str().to_string());
        active.updated_at = Set(Utc::now().naive_utc());
        mutate(&mut active);
        active.update(&txn).await?;

        txn.commit().await?;

        let change = StatusChange {
            key_id,
            group_id,
            old_status,
            new_status,
        };
        self.sync_rotation(change).await;
        Ok(change)
    }

    /// 把状态变更同步到共享存储
    ///
    /// 后台路径：存储故障只记日志，不向调用方传播。
    async fn sync_rotation(&self, change: StatusChange) {
        let detail_key = key_detail_key(change.key_id);
        let list_key = active_keys_key(change.group_id);
        let id_str = change.key_id.to_string();

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), change.new_status.as_str().to_string());
        if let Err(err) = self.store.hset(&detail_key, fields).await {
            lwarn!(
                "system",
                LogStage::Store,
                LogComponent::KeyState,
                "rotation_sync_hset_failed",
                "Failed to sync key status to store",
                key_id = change.key_id,
                error = %err
            );
            return;
        }

        let became_selectable =
            change.new_status.is_selectable() && !change.old_status.is_selectable();
        let lost_selectable =
            !change.new_status.is_selectable() && change.old_status.is_selectable();

        if became_selectable {
            // 先移除避免重复入列
            let _ = self.store.lrem(&list_key, 0, &id_str).await;
            if let Err(err) = self.store.lpush(&list_key, &[id_str]).await {
                lwarn!(
                    "system",
                    LogStage::Store,
                    LogComponent::KeyState,
                    "rotation_sync_push_failed",
                    "Failed to add key to rotation list",
                    key_id = change.key_id,
                    error = %err
                );
            }
        } else if lost_selectable {
            if let Err(err) = self.store.lrem(&list_key, 0, &id_str).await {
                lwarn!(
                    "system",
                    LogStage::Store,
                    LogComponent::KeyState,
                    "rotation_sync_remove_failed",
                    "Failed to remove key from rotation list",
                    key_id = change.key_id,
                    error = %err
                );
            }
        }
    }
}
