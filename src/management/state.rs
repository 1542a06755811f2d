//! # 管理面共享状态

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::sync::Mutex;

use crate::config::{AppConfig, SystemSettingsManager};
use crate::keypool::{
    GroupManager, IncrementalValidationService, KeyProvider, KeyStateService, KeyValidator,
};
use crate::policy::PolicyEngine;

/// 管理面共享状态
#[derive(Clone)]
pub struct ManagementState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub settings: Arc<SystemSettingsManager>,
    pub group_manager: Arc<GroupManager>,
    pub provider: Arc<KeyProvider>,
    pub state_service: Arc<KeyStateService>,
    pub validator: Arc<KeyValidator>,
    pub incremental: Arc<IncrementalValidationService>,
    pub policy_engine: Arc<PolicyEngine>,
    /// 校验任务互斥：同一时间只允许一个校验控制面任务
    pub validation_lock: Arc<Mutex<()>>,
}
