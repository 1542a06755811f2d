//! # 定时检查器
//!
//! 固定节拍扫描分组：到达校验间隔的分组只复查其无效密钥，
//! 有限并发探测，探测通过的密钥回到活跃并重新进入轮转。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::group_manager::{GroupInfo, GroupManager};
use super::state_machine::KeyStatus;
use super::store_keys::sync_membership;
use super::validator::KeyValidator;
use crate::logging::{LogComponent, LogStage};
use crate::store::Store;
use crate::{ldebug, lerror, linfo, lwarn};

/// 扫描节拍
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// 定时检查器
pub struct CronChecker {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn Store>,
    group_manager: Arc<GroupManager>,
    validator: Arc<KeyValidator>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronChecker {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn Store>,
        group_manager: Arc<GroupManager>,
        validator: Arc<KeyValidator>,
    ) -> Self {
        Self {
            db,
            store,
            group_manager,
            validator,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// 启动后台循环
    pub async fn start(self: &Arc<Self>) {
        let checker = Arc::clone(self);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            // 错过的节拍不补
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        checker.submit_validation_jobs().await;
                    }
                }
            }

            ldebug!(
                "system",
                LogStage::Shutdown,
                LogComponent::CronChecker,
                "cron_loop_exit",
                "Cron checker loop stopped"
            );
        });

        *self.handle.lock().await = Some(handle);
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::CronChecker,
            "cron_started",
            "Cron checker started"
        );
    }

    /// 停止循环，等待在途工作直到截止时间
    ///
    /// 超过截止时间就放弃等待，进程正在关闭。
    pub async fn stop(&self, deadline: Duration) {
        self.cancel.cancel();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::CronChecker,
                    "cron_stop_timeout",
                    "Cron checker did not stop within deadline, abandoning"
                );
            }
        }

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::CronChecker,
            "cron_stopped",
            "Cron checker stopped"
        );
    }

    /// 扫描全部分组，给到期的分组派发校验任务
    pub async fn submit_validation_jobs(&self) {
        let groups = match self.group_manager.list().await {
            Ok(groups) => groups,
            Err(err) => {
                lerror!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::CronChecker,
                    "group_scan_failed",
                    "Failed to list groups for validation",
                    error = %err
                );
                return;
            }
        };

        let now = Utc::now().naive_utc();
        for group in groups {
            let info = match self.group_manager.get_by_id(group.id).await {
                Ok(info) => info,
                Err(err) => {
                    lerror!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::CronChecker,
                        "group_resolve_failed",
                        "Failed to resolve group for validation",
                        group_id = group.id,
                        error = %err
                    );
                    continue;
                }
            };

            let interval =
                chrono::Duration::minutes(info.effective_config.key_validation_interval_minutes);
            let due = group
                .last_validated_at
                .is_none_or(|last| now - last >= interval);

            if due {
                self.validate_group_invalid_keys(&info).await;
            }
        }
    }

    /// 复查分组内的无效密钥
    async fn validate_group_invalid_keys(&self, group: &Arc<GroupInfo>) {
        let keys = match entity::api_keys::Entity::find()
            .filter(entity::api_keys::Column::GroupId.eq(group.model.id))
            .filter(entity::api_keys::Column::Status.eq(KeyStatus::Invalid.as_str()))
            .all(self.db.as_ref())
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                lerror!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::CronChecker,
                    "invalid_keys_query_failed",
                    "Failed to load invalid keys",
                    group_id = group.model.id,
                    error = %err
                );
                return;
            }
        };

        if !keys.is_empty() {
            let concurrency = group
                .effective_config
                .key_validation_concurrency
                .max(1) as usize;
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut tasks = Vec::with_capacity(keys.len());

            for key in keys {
                let semaphore = Arc::clone(&semaphore);
                let validator = Arc::clone(&self.validator);
                let db = Arc::clone(&self.db);
                let store = Arc::clone(&self.store);
                let group = Arc::clone(group);

                tasks.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    revalidate_invalid_key(&db, store.as_ref(), &validator, &group, key).await;
                }));
            }

            for task in tasks {
                let _ = task.await;
            }
        }

        // 无论是否有无效密钥都推进分组的校验时间
        let now = Utc::now().naive_utc();
        let active = entity::groups::ActiveModel {
            id: Set(group.model.id),
            last_validated_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        if let Err(err) = active.update(self.db.as_ref()).await {
            lerror!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::CronChecker,
                "group_timestamp_update_failed",
                "Failed to update group validation timestamp",
                group_id = group.model.id,
                error = %err
            );
        }
    }
}

/// 复查单个无效密钥，探测通过即恢复活跃
async fn revalidate_invalid_key(
    db: &DatabaseConnection,
    store: &dyn Store,
    validator: &KeyValidator,
    group: &GroupInfo,
    key: entity::api_keys::Model,
) {
    let now = Utc::now().naive_utc();
    let key_id = key.id;
    let group_id = key.group_id;

    match validator.validate_single_key(&key, group).await {
        Ok(true) => {
            let mut active: entity::api_keys::ActiveModel = key.into();
            active.status = Set(KeyStatus::Active.as_str().to_string());
            active.consecutive_failures = Set(0);
            active.last_validated_at = Set(Some(now));
            active.last_error_message = Set(String::new());
            active.updated_at = Set(now);

            if let Err(err) = active.update(db).await {
                lerror!(
                    "system",
                    LogStage::KeyValidation,
                    LogComponent::CronChecker,
                    "key_recovery_write_failed",
                    "Failed to persist recovered key",
                    key_id = key_id,
                    error = %err
                );
                return;
            }
            sync_membership(store, group_id, key_id, KeyStatus::Active).await;

            linfo!(
                "system",
                LogStage::KeyValidation,
                LogComponent::CronChecker,
                "invalid_key_recovered",
                "Invalid key passed revalidation and was reactivated",
                key_id = key_id,
                group_id = group_id
            );
        }
        Ok(false) => {
            let mut active: entity::api_keys::ActiveModel = key.into();
            active.last_validated_at = Set(Some(now));
            active.updated_at = Set(now);
            if let Err(err) = active.update(db).await {
                lwarn!(
                    "system",
                    LogStage::KeyValidation,
                    LogComponent::CronChecker,
                    "key_timestamp_write_failed",
                    "Failed to persist validation timestamp",
                    key_id = key_id,
                    error = %err
                );
            }
        }
        Err(err) => {
            // 传输层失败不下结论，等下一轮
            ldebug!(
                "system",
                LogStage::KeyValidation,
                LogComponent::CronChecker,
                "key_probe_inconclusive",
                "Key probe failed with transport error, keeping status",
                key_id = key_id,
                error = %err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::config::SystemSettingsManager;
    use crate::encryption;
    use crate::store::MemoryStore;
    use crate::testing;

    async fn build_checker() -> (Arc<CronChecker>, Arc<DatabaseConnection>) {
        let db = testing::setup_test_db().await;
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let settings = Arc::new(SystemSettingsManager::new(
            Arc::clone(&db),
            Arc::clone(&store),
        ));
        let group_manager = Arc::new(GroupManager::new(
            Arc::clone(&db),
            Arc::clone(&store),
            settings,
        ));
        let channels = Arc::new(ChannelRegistry::new().unwrap());
        let encryption = Arc::new(encryption::Service::new("").unwrap());
        let validator = Arc::new(KeyValidator::new(channels, encryption));
        let checker = Arc::new(CronChecker::new(db.clone(), store, group_manager, validator));
        (checker, db)
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (checker, _db) = build_checker().await;
        checker.start().await;
        checker.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_submit_jobs_with_no_groups() {
        let (checker, _db) = build_checker().await;
        checker.submit_validation_jobs().await;
    }

    #[tokio::test]
    async fn test_due_group_gets_timestamp_even_without_invalid_keys() {
        let (checker, db) = build_checker().await;
        let group = testing::insert_group(db.as_ref(), "cron-group").await;
        assert!(group.last_validated_at.is_none());

        checker.submit_validation_jobs().await;

        let updated = entity::groups::Entity::find_by_id(group.id)
            .one(db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert!(updated.last_validated_at.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_probe_keeps_status() {
        let (checker, db) = build_checker().await;
        // 测试分组的上游指向未监听的端口，探测走传输层失败
        let group = testing::insert_group(db.as_ref(), "cron-group").await;
        let key = testing::insert_key(db.as_ref(), group.id, "sk-1", "invalid", 3, 1).await;

        checker.submit_validation_jobs().await;

        let updated = entity::api_keys::Entity::find_by_id(key.id)
            .one(db.as_ref())
            .await
            .unwrap()
            .unwrap();
        // 结论未知，状态保持无效
        assert_eq!(updated.status, "invalid");
    }
}
