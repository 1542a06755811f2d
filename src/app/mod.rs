//! # 组合根
//!
//! 所有组件显式构造并注入：数据库句柄和共享存储是进程级
//! 单例，作为构造参数传入每个组件，不走环境全局量。

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::get;
use sea_orm::{Database, DatabaseConnection};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;

use crate::channel::ChannelRegistry;
use crate::config::{AppConfig, SystemSettingsManager};
use crate::encryption;
use crate::error::{ProxyError, Result};
use crate::keypool::{
    CronChecker, GroupManager, IncrementalValidationService, KeyPolicyHandler, KeyProvider,
    KeyStateService, KeyValidator,
};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::management::{ManagementState, management_router};
use crate::policy::PolicyEngine;
use crate::proxy::{ProxyState, RequestExecutor, RequestLogService, proxy_router};
use crate::store::{Store, build_store};

/// 应用上下文
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub store: Arc<dyn Store>,
    pub encryption: Arc<encryption::Service>,
    pub settings: Arc<SystemSettingsManager>,
    pub group_manager: Arc<GroupManager>,
    pub channels: Arc<ChannelRegistry>,
    pub policy_engine: Arc<PolicyEngine>,
    pub state_service: Arc<KeyStateService>,
    pub provider: Arc<KeyProvider>,
    pub validator: Arc<KeyValidator>,
    pub incremental: Arc<IncrementalValidationService>,
    pub request_log: Arc<RequestLogService>,
    pub executor: Arc<RequestExecutor>,
    pub cron: Arc<CronChecker>,
}

impl AppContext {
    /// 构建全部组件
    ///
    /// 主节点跑迁移、补默认设置并装载密钥池；从节点只读共享
    /// 状态，跟随发布订阅事件收敛。
    pub async fn build(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);

        let db = Arc::new(
            Database::connect(&config.database_dsn)
                .await
                .map_err(|e| ProxyError::database_with_source("failed to connect database", e))?,
        );
        if !config.is_slave {
            use migration::MigratorTrait;
            migration::Migrator::up(db.as_ref(), None)
                .await
                .map_err(|e| ProxyError::database_with_source("failed to run migrations", e))?;
        }

        let store = build_store(&config.redis_dsn).await?;
        let encryption = Arc::new(encryption::Service::new(&config.encryption_key)?);

        let settings = Arc::new(SystemSettingsManager::new(
            Arc::clone(&db),
            Arc::clone(&store),
        ));
        settings.initialize(!config.is_slave).await?;
        settings.start_change_listener();

        let group_manager = Arc::new(GroupManager::new(
            Arc::clone(&db),
            Arc::clone(&store),
            Arc::clone(&settings),
        ));
        group_manager.start_change_listener();

        let channels = Arc::new(ChannelRegistry::new()?);
        let policy_engine = Arc::new(PolicyEngine::new(Arc::clone(&db)));
        let state_service = Arc::new(KeyStateService::new(Arc::clone(&db), Arc::clone(&store)));
        let policy_handler = Arc::new(KeyPolicyHandler::new(
            Arc::clone(&policy_engine),
            Arc::clone(&state_service),
        ));
        let provider = Arc::new(KeyProvider::new(
            Arc::clone(&db),
            Arc::clone(&store),
            Arc::clone(&encryption),
            policy_handler,
        ));
        let validator = Arc::new(KeyValidator::new(
            Arc::clone(&channels),
            Arc::clone(&encryption),
        ));
        let incremental = Arc::new(IncrementalValidationService::new(
            Arc::clone(&db),
            Arc::clone(&store),
            Arc::clone(&validator),
            Arc::clone(&group_manager),
        ));
        let request_log = Arc::new(RequestLogService::new(Arc::clone(&db)));
        let executor = Arc::new(RequestExecutor::new(
            Arc::clone(&provider),
            Arc::clone(&channels),
            Arc::clone(&request_log),
        ));
        let cron = Arc::new(CronChecker::new(
            Arc::clone(&db),
            Arc::clone(&store),
            Arc::clone(&group_manager),
            Arc::clone(&validator),
        ));

        if !config.is_slave {
            provider.load_keys_from_db().await?;
        }

        Ok(Self {
            config,
            db,
            store,
            encryption,
            settings,
            group_manager,
            channels,
            policy_engine,
            state_service,
            provider,
            validator,
            incremental,
            request_log,
            executor,
            cron,
        })
    }

    /// 装配完整路由
    pub fn router(&self) -> Router {
        let proxy_state = ProxyState {
            group_manager: Arc::clone(&self.group_manager),
            policy_engine: Arc::clone(&self.policy_engine),
            executor: Arc::clone(&self.executor),
        };
        let management_state = ManagementState {
            db: Arc::clone(&self.db),
            config: Arc::clone(&self.config),
            settings: Arc::clone(&self.settings),
            group_manager: Arc::clone(&self.group_manager),
            provider: Arc::clone(&self.provider),
            state_service: Arc::clone(&self.state_service),
            validator: Arc::clone(&self.validator),
            incremental: Arc::clone(&self.incremental),
            policy_engine: Arc::clone(&self.policy_engine),
            validation_lock: Arc::new(tokio::sync::Mutex::new(())),
        };

        let mut router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .merge(proxy_router(proxy_state).layer(GlobalConcurrencyLimitLayer::new(
                self.config.max_concurrent_requests,
            )))
            .merge(management_router(management_state));

        if self.config.cors.enabled {
            router = router.layer(self.cors_layer());
        }

        router
    }

    /// 启动后台任务
    pub async fn start_background(&self) {
        if self.config.is_slave {
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Main,
                "slave_mode",
                "Running in slave mode, cron checker disabled"
            );
            return;
        }
        self.cron.start().await;
    }

    /// 优雅停机：停掉后台循环，等待不超过配置的时长
    pub async fn shutdown(&self) {
        self.cron
            .stop(Duration::from_secs(self.config.graceful_shutdown_timeout))
            .await;
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "shutdown_complete",
            "Shutdown complete"
        );
    }

    fn cors_layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .config
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    }
}
