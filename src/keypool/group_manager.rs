//! # 分组管理器
//!
//! 按名称解析分组并缓存解析结果（上游列表、请求头规则、
//! 生效配置）。分组变更事件到达后缓存整体失效。

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{
    EVENT_GROUPS_CHANGED, SYSTEM_EVENTS_CHANNEL, SystemSettings, SystemSettingsManager,
};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::Store;
use crate::{ldebug, lerror};

/// 请求头改写规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// set / remove
    #[serde(default = "default_header_action")]
    pub action: String,
}

fn default_header_action() -> String {
    "set".to_string()
}

/// 解析后的分组
///
/// 密钥通过 `group_id` 弱引用分组，这里不持有密钥集合。
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub model: entity::groups::Model,
    pub upstreams: Vec<String>,
    pub header_rules: Vec<HeaderRule>,
    pub proxy_keys: Vec<String>,
    pub effective_config: SystemSettings,
}

impl GroupInfo {
    /// 本地代理密钥是否在分组的允许列表内
    #[must_use]
    pub fn allows_proxy_key(&self, candidate: &str) -> bool {
        !candidate.is_empty() && self.proxy_keys.iter().any(|k| k == candidate)
    }

    /// 首个上游基础地址
    #[must_use]
    pub fn primary_upstream(&self) -> Option<&str> {
        self.upstreams.first().map(String::as_str)
    }
}

/// 分组管理器
pub struct GroupManager {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn Store>,
    settings: Arc<SystemSettingsManager>,
    /// name → 解析后的分组
    cache: RwLock<HashMap<String, Arc<GroupInfo>>>,
}

impl GroupManager {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn Store>,
        settings: Arc<SystemSettingsManager>,
    ) -> Self {
        Self {
            db,
            store,
            settings,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 按名称解析分组
    pub async fn get_by_name(&self, name: &str) -> Result<Arc<GroupInfo>> {
        {
            let cache = self.cache.read().await;
            if let Some(info) = cache.get(name) {
                return Ok(Arc::clone(info));
            }
        }

        let model = entity::groups::Entity::find()
            .filter(entity::groups::Column::Name.eq(name))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ProxyError::not_found("group", name))?;

        let info = Arc::new(self.resolve(model));
        self.cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&info));
        Ok(info)
    }

    /// 按 id 解析分组，不走缓存
    pub async fn get_by_id(&self, group_id: i32) -> Result<Arc<GroupInfo>> {
        let model = entity::groups::Entity::find_by_id(group_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ProxyError::not_found("group", group_id.to_string()))?;
        Ok(Arc::new(self.resolve(model)))
    }

    /// 全部分组，按 sort 排序
    pub async fn list(&self) -> Result<Vec<entity::groups::Model>> {
        Ok(entity::groups::Entity::find()
            .order_by_asc(entity::groups::Column::Sort)
            .order_by_asc(entity::groups::Column::Id)
            .all(self.db.as_ref())
            .await?)
    }

    /// 清空缓存
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
        ldebug!(
            "system",
            LogStage::Configuration,
            LogComponent::GroupManager,
            "group_cache_invalidated",
            "Group cache cleared"
        );
    }

    /// 广播分组变更事件，所有副本（含本进程）清空缓存
    pub async fn publish_changed(&self) {
        self.invalidate().await;
        if let Err(err) = self
            .store
            .publish(SYSTEM_EVENTS_CHANNEL, EVENT_GROUPS_CHANGED.as_bytes())
            .await
        {
            lerror!(
                "system",
                LogStage::Configuration,
                LogComponent::GroupManager,
                "group_event_publish_failed",
                "Failed to publish group change event",
                error = %err
            );
        }
    }

    /// 启动跨副本变更监听
    pub fn start_change_listener(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut subscription = match manager.store.subscribe(SYSTEM_EVENTS_CHANNEL).await {
                Ok(sub) => sub,
                Err(err) => {
                    lerror!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::GroupManager,
                        "group_subscribe_failed",
                        "Failed to subscribe to system events",
                        error = %err
                    );
                    return;
                }
            };

            while let Some(message) = subscription.recv().await {
                if message.payload == EVENT_GROUPS_CHANGED.as_bytes() {
                    manager.invalidate().await;
                }
            }
        });
    }

    /// 把实体解析成随取随用的形态
    fn resolve(&self, model: entity::groups::Model) -> GroupInfo {
        let upstreams: Vec<String> =
            serde_json::from_value(model.upstreams.clone()).unwrap_or_default();
        let header_rules: Vec<HeaderRule> =
            serde_json::from_value(model.header_rules.clone()).unwrap_or_default();
        let proxy_keys: Vec<String> = model
            .proxy_keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        let effective_config = self.settings.get_effective_config(&model.config);

        GroupInfo {
            model,
            upstreams,
            header_rules,
            proxy_keys,
            effective_config,
        }
    }
}
