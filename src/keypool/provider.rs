//! # 密钥提供者
//!
//! 持有共享存储里的轮转列表和密钥详情哈希。
//! 选取走一次原子轮转；增删改以数据库为准再同步存储。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    sea_query::Expr,
};

use super::policy_handler::KeyPolicyHandler;
use super::state_machine::KeyStatus;
use super::store_keys::{active_keys_key, key_detail_key};
use crate::encryption;
use crate::error::{ProxyError, Result, is_uncounted};
use crate::keypool::GroupInfo;
use crate::logging::{LogComponent, LogStage, sanitize_api_key};
use crate::store::Store;
use crate::{ldebug, lerror, linfo};

/// 一次轮转选出的密钥
///
/// `key_value` 是解密后的明文，只在本次请求的内存里存在。
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: i64,
    pub group_id: i32,
    pub key_value: String,
    pub key_hash: String,
    pub status: String,
    pub failure_count: i64,
    pub request_count: i64,
}

/// 批量添加的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddKeysResult {
    pub added: u64,
    pub ignored: u64,
}

/// 密钥提供者
pub struct KeyProvider {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn Store>,
    encryption: Arc<encryption::Service>,
    policy_handler: Arc<KeyPolicyHandler>,
}

impl KeyProvider {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn Store>,
        encryption: Arc<encryption::Service>,
        policy_handler: Arc<KeyPolicyHandler>,
    ) -> Self {
        Self {
            db,
            store,
            encryption,
            policy_handler,
        }
    }

    /// 从数据库重建存储
    ///
    /// 启动时和集群级失效时调用：每个分组原子替换轮转列表，
    /// 重灌每个密钥的详情哈希。
    pub async fn load_keys_from_db(&self) -> Result<()> {
        let groups = entity::groups::Entity::find().all(self.db.as_ref()).await?;

        for group in &groups {
            let keys = entity::api_keys::Entity::find()
                .filter(entity::api_keys::Column::GroupId.eq(group.id))
                .all(self.db.as_ref())
                .await?;

            let list_key = active_keys_key(group.id);
            self.store.delete(&list_key).await?;

            let mut selectable_ids = Vec::new();
            for key in &keys {
                self.store
                    .hset(&key_detail_key(key.id), detail_fields(key))
                    .await?;
                let selectable = KeyStatus::parse(&key.status)
                    .is_some_and(|status| status.is_selectable());
                if selectable {
                    selectable_ids.push(key.id.to_string());
                }
            }

            if !selectable_ids.is_empty() {
                self.store.lpush(&list_key, &selectable_ids).await?;
            }

            ldebug!(
                "system",
                LogStage::Startup,
                LogComponent::KeyPool,
                "group_keys_loaded",
                "Loaded group keys into store",
                group_id = group.id,
                total = keys.len(),
                selectable = selectable_ids.len()
            );
        }

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::KeyPool,
            "keys_loaded",
            "Key pool loaded from database",
            groups = groups.len()
        );
        Ok(())
    }

    /// 轮转选取一个密钥
    ///
    /// 失败语义：列表为空返回 `NoActiveKeys`；id 解析失败或
    /// 详情读取失败返回内部错误。
    pub async fn select_key(&self, group_id: i32) -> Result<SelectedKey> {
        let list_key = active_keys_key(group_id);

        let raw_id = self.store.rotate(&list_key).await.map_err(|err| {
            if matches!(err, ProxyError::StoreNotFound { .. }) {
                ProxyError::no_active_keys(format!("no active keys in group {group_id}"))
            } else {
                ProxyError::internal_with_source("failed to rotate key list", err)
            }
        })?;

        let key_id: i64 = raw_id
            .parse()
            .map_err(|_| ProxyError::internal(format!("failed to parse key ID: {raw_id}")))?;

        let details = self
            .store
            .hget_all(&key_detail_key(key_id))
            .await
            .map_err(|err| ProxyError::internal_with_source("failed to get key details", err))?;
        if details.is_empty() {
            return Err(ProxyError::internal(format!(
                "failed to get key details for key {key_id}"
            )));
        }

        let ciphertext = details.get("key_string").cloned().unwrap_or_default();
        let key_value = self
            .encryption
            .decrypt(&ciphertext)
            .map_err(|err| ProxyError::internal_with_source("failed to decrypt key", err))?;

        Ok(SelectedKey {
            id: key_id,
            group_id,
            key_value,
            key_hash: details.get("key_hash").cloned().unwrap_or_default(),
            status: details
                .get("status")
                .cloned()
                .unwrap_or_else(|| KeyStatus::Active.as_str().to_string()),
            failure_count: parse_i64(details.get("failure_count")),
            request_count: parse_i64(details.get("request_count")),
        })
    }

    /// 上报一次请求结果
    ///
    /// 不计数错误直接返回；其余异步更新计数并驱动策略处理，
    /// 不持有任何跨网络 IO 的锁。
    pub fn update_status(
        self: &Arc<Self>,
        key: &SelectedKey,
        group: &Arc<GroupInfo>,
        is_success: bool,
        error_message: &str,
    ) {
        if !is_success && is_uncounted(error_message) {
            ldebug!(
                "system",
                LogStage::Scheduling,
                LogComponent::KeyPool,
                "uncounted_error_skipped",
                "Skipping state update for uncounted error",
                key_id = key.id,
                key = %sanitize_api_key(&key.key_value),
                error_message = %error_message
            );
            return;
        }

        let provider = Arc::clone(self);
        let key = key.clone();
        let group = Arc::clone(group);
        let error_message = error_message.to_string();

        tokio::spawn(async move {
            provider
                .apply_status_update(&key, &group, is_success, &error_message)
                .await;
        });
    }

    async fn apply_status_update(
        &self,
        key: &SelectedKey,
        group: &GroupInfo,
        is_success: bool,
        error_message: &str,
    ) {
        let detail_key = key_detail_key(key.id);

        // 存储侧计数
        if let Err(err) = self.store.hincr_by(&detail_key, "request_count", 1).await {
            lerror!(
                "system",
                LogStage::Store,
                LogComponent::KeyPool,
                "request_count_incr_failed",
                "Failed to increment request counter in store",
                key_id = key.id,
                error = %err
            );
        }
        if !is_success {
            if let Err(err) = self.store.hincr_by(&detail_key, "failure_count", 1).await {
                lerror!(
                    "system",
                    LogStage::Store,
                    LogComponent::KeyPool,
                    "failure_count_incr_failed",
                    "Failed to increment failure counter in store",
                    key_id = key.id,
                    error = %err
                );
            }
        }

        // 数据库侧计数，原子自增
        let now = Utc::now().naive_utc();
        let mut update = entity::api_keys::Entity::update_many()
            .col_expr(
                entity::api_keys::Column::RequestCount,
                Expr::col(entity::api_keys::Column::RequestCount).add(1),
            )
            .col_expr(
                entity::api_keys::Column::LastUsedAt,
                Expr::value(Some(now)),
            );
        if !is_success {
            update = update.col_expr(
                entity::api_keys::Column::FailureCount,
                Expr::col(entity::api_keys::Column::FailureCount).add(1),
            );
        }
        if let Err(err) = update
            .filter(entity::api_keys::Column::Id.eq(key.id))
            .exec(self.db.as_ref())
            .await
        {
            lerror!(
                "system",
                LogStage::Db,
                LogComponent::KeyPool,
                "counter_update_failed",
                "Failed to update key counters in database",
                key_id = key.id,
                error = %err
            );
        }

        // 策略联动
        if is_success {
            self.policy_handler.handle_key_success(key.id).await;
        } else {
            self.policy_handler
                .handle_key_failure(key, group, error_message)
                .await;
        }
    }

    /// 幂等批量添加
    ///
    /// 同一 `(group_id, key_hash)` 已存在时跳过；新密钥以
    /// Pending 状态入库并写入存储，等待校验后进入轮转。
    pub async fn add_keys(&self, group_id: i32, key_values: &[String]) -> Result<AddKeysResult> {
        let mut result = AddKeysResult::default();
        let mut seen = HashSet::new();
        let now = Utc::now().naive_utc();

        for raw in key_values {
            let key_value = raw.trim();
            if key_value.is_empty() {
                continue;
            }

            let key_hash = self.encryption.hash(key_value);
            if !seen.insert(key_hash.clone()) {
                result.ignored += 1;
                continue;
            }

            let exists = entity::api_keys::Entity::find()
                .filter(entity::api_keys::Column::GroupId.eq(group_id))
                .filter(entity::api_keys::Column::KeyHash.eq(key_hash.clone()))
                .one(self.db.as_ref())
                .await?;
            if exists.is_some() {
                result.ignored += 1;
                continue;
            }

            let ciphertext = self.encryption.encrypt(key_value)?;
            let active = entity::api_keys::ActiveModel {
                group_id: Set(group_id),
                key_value: Set(ciphertext),
                key_hash: Set(key_hash),
                status: Set(KeyStatus::Pending.as_str().to_string()),
                request_count: Set(0),
                failure_count: Set(0),
                consecutive_failures: Set(0),
                backoff_level: Set(0),
                last_used_at: Set(None),
                last_failure_at: Set(None),
                last_success_at: Set(None),
                last_validated_at: Set(None),
                disabled_until: Set(None),
                last_error_message: Set(String::new()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            let inserted = active.insert(self.db.as_ref()).await?;

            self.store
                .hset(&key_detail_key(inserted.id), detail_fields(&inserted))
                .await?;
            self.sync_rotation_membership(&inserted).await;

            result.added += 1;
        }

        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyPool,
            "keys_added",
            "Keys added to group",
            group_id = group_id,
            added = result.added,
            ignored = result.ignored
        );
        Ok(result)
    }

    /// 按明文值删除密钥，返回删除数量
    pub async fn remove_keys(&self, group_id: i32, key_values: &[String]) -> Result<u64> {
        if key_values.is_empty() {
            return Ok(0);
        }

        let hashes: Vec<String> = key_values
            .iter()
            .map(|v| self.encryption.hash(v.trim()))
            .collect();

        let rows = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id))
            .filter(entity::api_keys::Column::KeyHash.is_in(hashes))
            .all(self.db.as_ref())
            .await?;

        self.delete_rows(group_id, rows).await
    }

    /// 删除分组内全部无效密钥
    pub async fn remove_invalid_keys(&self, group_id: i32) -> Result<u64> {
        let rows = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id))
            .filter(entity::api_keys::Column::Status.eq(KeyStatus::Invalid.as_str()))
            .all(self.db.as_ref())
            .await?;
        self.delete_rows(group_id, rows).await
    }

    /// 删除分组内全部密钥
    pub async fn remove_all_keys(&self, group_id: i32) -> Result<u64> {
        let rows = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id))
            .all(self.db.as_ref())
            .await?;
        self.delete_rows(group_id, rows).await
    }

    /// 恢复分组内全部无效密钥为活跃
    pub async fn restore_keys(&self, group_id: i32) -> Result<u64> {
        let rows = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id))
            .filter(entity::api_keys::Column::Status.eq(KeyStatus::Invalid.as_str()))
            .all(self.db.as_ref())
            .await?;
        self.restore_rows(group_id, rows).await
    }

    /// 恢复列出的无效密钥
    pub async fn restore_multiple_keys(
        &self,
        group_id: i32,
        key_values: &[String],
    ) -> Result<u64> {
        if key_values.is_empty() {
            return Ok(0);
        }
        let hashes: Vec<String> = key_values
            .iter()
            .map(|v| self.encryption.hash(v.trim()))
            .collect();
        let rows = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id))
            .filter(entity::api_keys::Column::Status.eq(KeyStatus::Invalid.as_str()))
            .filter(entity::api_keys::Column::KeyHash.is_in(hashes))
            .all(self.db.as_ref())
            .await?;
        self.restore_rows(group_id, rows).await
    }

    /// 分组删除时清掉存储里的轮转列表和密钥详情
    pub async fn remove_keys_from_store(&self, group_id: i32, key_ids: &[i64]) -> Result<()> {
        self.store.delete(&active_keys_key(group_id)).await?;
        let detail_keys: Vec<String> = key_ids.iter().map(|id| key_detail_key(*id)).collect();
        self.store.del(&detail_keys).await?;
        Ok(())
    }

    async fn delete_rows(
        &self,
        group_id: i32,
        rows: Vec<entity::api_keys::Model>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let deleted = entity::api_keys::Entity::delete_many()
            .filter(entity::api_keys::Column::Id.is_in(ids.clone()))
            .exec(self.db.as_ref())
            .await?
            .rows_affected;

        let list_key = active_keys_key(group_id);
        for id in &ids {
            let _ = self.store.lrem(&list_key, 0, &id.to_string()).await;
            let _ = self.store.delete(&key_detail_key(*id)).await;
        }

        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyPool,
            "keys_removed",
            "Keys removed from group",
            group_id = group_id,
            removed = deleted
        );
        Ok(deleted)
    }

    async fn restore_rows(
        &self,
        group_id: i32,
        rows: Vec<entity::api_keys::Model>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let now = Utc::now().naive_utc();
        let restored = entity::api_keys::Entity::update_many()
            .col_expr(
                entity::api_keys::Column::Status,
                Expr::value(KeyStatus::Active.as_str()),
            )
            .col_expr(entity::api_keys::Column::FailureCount, Expr::value(0i64))
            .col_expr(
                entity::api_keys::Column::ConsecutiveFailures,
                Expr::value(0i64),
            )
            .col_expr(entity::api_keys::Column::BackoffLevel, Expr::value(0i32))
            .col_expr(
                entity::api_keys::Column::DisabledUntil,
                Expr::value(Option::<chrono::NaiveDateTime>::None),
            )
            .col_expr(
                entity::api_keys::Column::LastErrorMessage,
                Expr::value(String::new()),
            )
            .col_expr(entity::api_keys::Column::UpdatedAt, Expr::value(now))
            .filter(entity::api_keys::Column::Id.is_in(ids.clone()))
            .exec(self.db.as_ref())
            .await?
            .rows_affected;

        let list_key = active_keys_key(group_id);
        for row in &rows {
            let mut fields = detail_fields(row);
            fields.insert(
                "status".to_string(),
                KeyStatus::Active.as_str().to_string(),
            );
            fields.insert("failure_count".to_string(), "0".to_string());
            self.store.hset(&key_detail_key(row.id), fields).await?;

            let id_str = row.id.to_string();
            let _ = self.store.lrem(&list_key, 0, &id_str).await;
            self.store.lpush(&list_key, &[id_str]).await?;
        }

        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::KeyPool,
            "keys_restored",
            "Invalid keys restored to active",
            group_id = group_id,
            restored = restored
        );
        Ok(restored)
    }

    /// 按当前状态维护轮转列表的成员关系
    async fn sync_rotation_membership(&self, key: &entity::api_keys::Model) {
        let selectable =
            KeyStatus::parse(&key.status).is_some_and(|status| status.is_selectable());
        let list_key = active_keys_key(key.group_id);
        let id_str = key.id.to_string();

        let _ = self.store.lrem(&list_key, 0, &id_str).await;
        if selectable {
            let _ = self.store.lpush(&list_key, &[id_str]).await;
        }
    }
}

/// 密钥详情哈希的字段
fn detail_fields(key: &entity::api_keys::Model) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert("id".to_string(), key.id.to_string());
    fields.insert("key_string".to_string(), key.key_value.clone());
    fields.insert("key_hash".to_string(), key.key_hash.clone());
    fields.insert("status".to_string(), key.status.clone());
    fields.insert("failure_count".to_string(), key.failure_count.to_string());
    fields.insert("request_count".to_string(), key.request_count.to_string());
    fields.insert("group_id".to_string(), key.group_id.to_string());
    fields.insert(
        "created_at".to_string(),
        key.created_at.and_utc().timestamp().to_string(),
    );
    fields
}

fn parse_i64(raw: Option<&String>) -> i64 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}
