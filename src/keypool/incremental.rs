//! # 增量校验服务
//!
//! 按时间窗口、状态集合和最近校验时间筛出一批密钥，
//! 分批扫描，批内生产者 → 有界队列 → N 个消费者并发探测，
//! 按结论回写状态。每个等待点都响应取消，取消返回部分结果。

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter,
};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::group_manager::{GroupInfo, GroupManager};
use super::state_machine::KeyStatus;
use super::store_keys::sync_membership;
use super::validator::KeyValidator;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::Store;
use crate::{lerror, linfo, lwarn};

/// 并发上限
const MAX_CONCURRENCY: usize = 20;
/// 批大小范围
const MIN_BATCH_SIZE: u64 = 10;
const MAX_BATCH_SIZE: u64 = 1000;

/// 增量校验配置
#[derive(Debug, Clone)]
pub struct IncrementalValidationConfig {
    /// 只校验这个时间窗口内创建的密钥
    pub time_window: Duration,
    /// 只校验这些状态的密钥
    pub include_states: Vec<KeyStatus>,
    /// 是否排除最近校验过的密钥
    pub exclude_recently_validated: bool,
    /// 最近校验的时间窗口
    pub recent_validation_window: Duration,
    /// 并发探测数量（1–20）
    pub concurrency: usize,
    /// 批处理大小（10–1000）
    pub batch_size: u64,
}

impl Default for IncrementalValidationConfig {
    fn default() -> Self {
        Self {
            time_window: Duration::hours(24),
            include_states: vec![KeyStatus::Pending, KeyStatus::Invalid],
            exclude_recently_validated: true,
            recent_validation_window: Duration::hours(1),
            concurrency: 5,
            batch_size: 100,
        }
    }
}

impl IncrementalValidationConfig {
    /// 把并发和批大小收敛到允许范围
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.clamp(1, MAX_CONCURRENCY);
        self.batch_size = self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        self
    }
}

/// 单个密钥的校验结果
#[derive(Debug, Clone, Serialize)]
pub struct IncrementalKeyValidationResult {
    pub key_id: i64,
    pub key_hash: String,
    pub old_status: String,
    pub new_status: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
    pub validated_at: chrono::NaiveDateTime,
}

/// 分组校验结果
#[derive(Debug, Clone, Serialize)]
pub struct IncrementalValidationResult {
    pub group_id: i32,
    pub group_name: String,
    pub total_keys: i64,
    pub validated_keys: i64,
    pub skipped_keys: i64,
    pub successful_keys: i64,
    pub failed_keys: i64,
    pub duration_ms: i64,
    pub key_results: Vec<IncrementalKeyValidationResult>,
    pub start_time: chrono::NaiveDateTime,
    pub end_time: chrono::NaiveDateTime,
}

impl IncrementalValidationResult {
    fn empty(group_id: i32, group_name: String) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            group_id,
            group_name,
            total_keys: 0,
            validated_keys: 0,
            skipped_keys: 0,
            successful_keys: 0,
            failed_keys: 0,
            duration_ms: 0,
            key_results: Vec::new(),
            start_time: now,
            end_time: now,
        }
    }
}

/// 增量校验服务
pub struct IncrementalValidationService {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn Store>,
    validator: Arc<KeyValidator>,
    group_manager: Arc<GroupManager>,
}

impl IncrementalValidationService {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn Store>,
        validator: Arc<KeyValidator>,
        group_manager: Arc<GroupManager>,
    ) -> Self {
        Self {
            db,
            store,
            validator,
            group_manager,
        }
    }

    /// 对单个分组执行增量校验
    pub async fn validate_group(
        &self,
        cancel: &CancellationToken,
        group_id: i32,
        config: IncrementalValidationConfig,
    ) -> Result<IncrementalValidationResult> {
        let config = config.normalized();
        let group = self.group_manager.get_by_id(group_id).await?;
        let started = Instant::now();
        let start_time = Utc::now().naive_utc();

        let query = self.build_query(group_id, &config, start_time);
        let total_keys = query.clone().count(self.db.as_ref()).await? as i64;

        let mut result = IncrementalValidationResult {
            group_id,
            group_name: group.model.name.clone(),
            total_keys,
            start_time,
            ..IncrementalValidationResult::empty(group_id, group.model.name.clone())
        };

        if total_keys == 0 {
            result.end_time = Utc::now().naive_utc();
            linfo!(
                "system",
                LogStage::KeyValidation,
                LogComponent::Validator,
                "incremental_no_keys",
                "No keys matched incremental validation filters",
                group_id = group_id,
                group = %result.group_name
            );
            return Ok(result);
        }

        linfo!(
            "system",
            LogStage::KeyValidation,
            LogComponent::Validator,
            "incremental_started",
            "Starting incremental validation",
            group_id = group_id,
            group = %result.group_name,
            total_keys = total_keys,
            concurrency = config.concurrency,
            batch_size = config.batch_size
        );

        let mut paginator = query.paginate(self.db.as_ref(), config.batch_size);
        while let Some(batch) = paginator.fetch_and_next().await? {
            if cancel.is_cancelled() {
                break;
            }

            let batch_results = self
                .validate_keys_batch(cancel, &group, batch, &config)
                .await;
            for key_result in batch_results {
                result.validated_keys += 1;
                if key_result.is_valid {
                    result.successful_keys += 1;
                } else {
                    result.failed_keys += 1;
                }
                result.key_results.push(key_result);
            }
        }

        result.skipped_keys = result.total_keys - result.validated_keys;
        result.end_time = Utc::now().naive_utc();
        result.duration_ms = started.elapsed().as_millis() as i64;

        linfo!(
            "system",
            LogStage::KeyValidation,
            LogComponent::Validator,
            "incremental_finished",
            "Incremental validation completed",
            group_id = group_id,
            group = %result.group_name,
            total_keys = result.total_keys,
            validated = result.validated_keys,
            successful = result.successful_keys,
            failed = result.failed_keys,
            skipped = result.skipped_keys,
            duration_ms = result.duration_ms,
            cancelled = cancel.is_cancelled()
        );
        Ok(result)
    }

    /// 对全部分组顺序执行增量校验
    ///
    /// 单个分组失败不影响其他分组，失败的分组产出空结果。
    pub async fn validate_all_groups(
        &self,
        cancel: &CancellationToken,
        config: IncrementalValidationConfig,
    ) -> Result<Vec<IncrementalValidationResult>> {
        let groups = self.group_manager.list().await?;
        let mut results = Vec::with_capacity(groups.len());

        for group in groups {
            if cancel.is_cancelled() {
                break;
            }
            match self
                .validate_group(cancel, group.id, config.clone())
                .await
            {
                Ok(result) => results.push(result),
                Err(err) => {
                    lerror!(
                        "system",
                        LogStage::KeyValidation,
                        LogComponent::Validator,
                        "incremental_group_failed",
                        "Failed to validate group, continuing with others",
                        group_id = group.id,
                        error = %err
                    );
                    results.push(IncrementalValidationResult::empty(group.id, group.name));
                }
            }
        }

        Ok(results)
    }

    /// 校验历史概览：状态分布和窗口内校验率
    pub async fn get_validation_history(
        &self,
        group_id: i32,
        range: Duration,
    ) -> Result<serde_json::Value> {
        let cutoff = Utc::now().naive_utc() - range;
        let base = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id));

        let total = base.clone().count(self.db.as_ref()).await? as i64;
        let validated = base
            .clone()
            .filter(entity::api_keys::Column::LastValidatedAt.gte(cutoff))
            .count(self.db.as_ref())
            .await? as i64;

        let mut by_status = serde_json::Map::new();
        for status in KeyStatus::all() {
            let count = base
                .clone()
                .filter(entity::api_keys::Column::Status.eq(status.as_str()))
                .count(self.db.as_ref())
                .await? as i64;
            by_status.insert(format!("{}_keys", status.as_str()), count.into());
        }

        let validation_rate = if total > 0 {
            validated as f64 / total as f64
        } else {
            0.0
        };

        let mut summary = serde_json::Map::new();
        summary.insert("total_keys".to_string(), total.into());
        summary.insert("validated_keys".to_string(), validated.into());
        summary.insert("validation_rate".to_string(), validation_rate.into());
        summary.extend(by_status);
        Ok(serde_json::Value::Object(summary))
    }

    /// 组装筛选查询
    fn build_query(
        &self,
        group_id: i32,
        config: &IncrementalValidationConfig,
        now: chrono::NaiveDateTime,
    ) -> sea_orm::Select<entity::api_keys::Entity> {
        let mut query = entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group_id));

        if config.time_window > Duration::zero() {
            query = query.filter(entity::api_keys::Column::CreatedAt.gte(now - config.time_window));
        }

        if !config.include_states.is_empty() {
            let states: Vec<&str> = config.include_states.iter().map(KeyStatus::as_str).collect();
            query = query.filter(entity::api_keys::Column::Status.is_in(states));
        }

        if config.exclude_recently_validated && config.recent_validation_window > Duration::zero() {
            let recent_cutoff = now - config.recent_validation_window;
            query = query.filter(
                Condition::any()
                    .add(entity::api_keys::Column::LastValidatedAt.is_null())
                    .add(entity::api_keys::Column::LastValidatedAt.lt(recent_cutoff)),
            );
        }

        query
    }

    /// 批内并发校验：生产者 → 有界队列 → N 个消费者 → 结果队列
    async fn validate_keys_batch(
        &self,
        cancel: &CancellationToken,
        group: &Arc<GroupInfo>,
        keys: Vec<entity::api_keys::Model>,
        config: &IncrementalValidationConfig,
    ) -> Vec<IncrementalKeyValidationResult> {
        let batch_len = keys.len();
        let (keys_tx, keys_rx) = mpsc::channel::<entity::api_keys::Model>(batch_len.max(1));
        let (results_tx, mut results_rx) =
            mpsc::channel::<IncrementalKeyValidationResult>(batch_len.max(1));
        let keys_rx = Arc::new(Mutex::new(keys_rx));

        // 消费者
        let mut workers = Vec::with_capacity(config.concurrency);
        for _ in 0..config.concurrency {
            let keys_rx = Arc::clone(&keys_rx);
            let results_tx = results_tx.clone();
            let cancel = cancel.clone();
            let group = Arc::clone(group);
            let validator = Arc::clone(&self.validator);
            let db = Arc::clone(&self.db);
            let store = Arc::clone(&self.store);

            workers.push(tokio::spawn(async move {
                loop {
                    let key = {
                        let mut receiver = keys_rx.lock().await;
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            maybe_key = receiver.recv() => match maybe_key {
                                Some(key) => key,
                                None => return,
                            },
                        }
                    };

                    let result =
                        validate_single(&db, store.as_ref(), &validator, &group, key).await;
                    if results_tx.send(result).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(results_tx);

        // 生产者
        let producer_cancel = cancel.clone();
        tokio::spawn(async move {
            for key in keys {
                tokio::select! {
                    () = producer_cancel.cancelled() => return,
                    sent = keys_tx.send(key) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        // 结果收集：消费者全部退出后通道关闭
        let mut results = Vec::with_capacity(batch_len);
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }

        for worker in workers {
            let _ = worker.await;
        }

        results
    }
}

/// 探测单个密钥并按结论回写
async fn validate_single(
    db: &DatabaseConnection,
    store: &dyn Store,
    validator: &KeyValidator,
    group: &GroupInfo,
    key: entity::api_keys::Model,
) -> IncrementalKeyValidationResult {
    let started = Instant::now();
    let validated_at = Utc::now().naive_utc();
    let old_status = KeyStatus::parse(&key.status).unwrap_or(KeyStatus::Pending);

    let (is_valid, error) = match validator.validate_single_key(&key, group).await {
        Ok(is_valid) => (is_valid, None),
        Err(err) => (false, Some(err.to_string())),
    };

    // 有效且之前未被信任 → 活跃；无效且尚未标记 → 无效；其余保持
    let new_status = if is_valid {
        if matches!(old_status, KeyStatus::Pending | KeyStatus::Invalid) {
            KeyStatus::Active
        } else {
            old_status
        }
    } else if old_status != KeyStatus::Invalid {
        KeyStatus::Invalid
    } else {
        old_status
    };

    let mut result = IncrementalKeyValidationResult {
        key_id: key.id,
        key_hash: key.key_hash.clone(),
        old_status: old_status.as_str().to_string(),
        new_status: new_status.as_str().to_string(),
        is_valid,
        error,
        duration_ms: 0,
        validated_at,
    };

    let group_id = key.group_id;
    let key_id = key.id;
    let mut active: entity::api_keys::ActiveModel = key.into();
    active.last_validated_at = Set(Some(validated_at));
    active.updated_at = Set(validated_at);
    if new_status != old_status {
        active.status = Set(new_status.as_str().to_string());
        if new_status == KeyStatus::Active {
            // 活跃状态下连续失败必须为零
            active.consecutive_failures = Set(0);
            active.backoff_level = Set(0);
            active.disabled_until = Set(None);
            active.last_error_message = Set(String::new());
        }
    }

    if let Err(err) = active.update(db).await {
        lwarn!(
            "system",
            LogStage::KeyValidation,
            LogComponent::Validator,
            "validation_write_failed",
            "Failed to persist key validation result",
            key_id = key_id,
            error = %err
        );
        if result.error.is_none() {
            result.error = Some(format!("failed to update database: {err}"));
        }
    } else if new_status != old_status {
        sync_membership(store, group_id, key_id, new_status).await;
    }

    result.duration_ms = started.elapsed().as_millis() as i64;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IncrementalValidationConfig::default();
        assert_eq!(config.time_window, Duration::hours(24));
        assert_eq!(
            config.include_states,
            vec![KeyStatus::Pending, KeyStatus::Invalid]
        );
        assert!(config.exclude_recently_validated);
        assert_eq!(config.recent_validation_window, Duration::hours(1));
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_config_normalization() {
        let config = IncrementalValidationConfig {
            concurrency: 0,
            batch_size: 5,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.batch_size, 10);

        let config = IncrementalValidationConfig {
            concurrency: 50,
            batch_size: 5000,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.batch_size, 1000);
    }
}
