//! # 增量校验端到端测试
//!
//! 无效密钥经探测通过后回到活跃并重新进入轮转；
//! 筛选条件（状态、最近校验时间）生效。

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::any;
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use keyproxy::channel::ChannelRegistry;
use keyproxy::config::SystemSettingsManager;
use keyproxy::encryption;
use keyproxy::keypool::{
    GroupManager, IncrementalValidationConfig, IncrementalValidationService, KeyStatus,
    KeyValidator, active_keys_key,
};
use keyproxy::store::{MemoryStore, Store};
use keyproxy::testing;

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock upstream");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

struct ValidationHarness {
    db: Arc<sea_orm::DatabaseConnection>,
    store: Arc<dyn Store>,
    service: IncrementalValidationService,
}

async fn build_harness() -> ValidationHarness {
    let db = testing::setup_test_db().await;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let encryption = Arc::new(encryption::Service::new("").unwrap());
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
    let validator = Arc::new(KeyValidator::new(channels, encryption));
    let service = IncrementalValidationService::new(
        Arc::clone(&db),
        Arc::clone(&store),
        validator,
        group_manager,
    );

    ValidationHarness { db, store, service }
}

#[tokio::test]
async fn test_validator_reclaims_invalid_key() {
    let harness = build_harness().await;

    // 探测端点总是放行
    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async { axum::Json(json!({"ok": true})).into_response() }),
    ))
    .await;

    let group = testing::insert_group_with(
        harness.db.as_ref(),
        "reclaim-group",
        "openai",
        json!({}),
        upstream,
    )
    .await;

    // K1 两小时前判为无效，从未进入最近校验窗口
    let key = testing::insert_key(harness.db.as_ref(), group.id, "sk-1", "invalid", 3, 1).await;
    let two_hours_ago = Utc::now().naive_utc() - Duration::hours(2);
    let mut active: entity::api_keys::ActiveModel = key.clone().into();
    active.created_at = Set(two_hours_ago);
    active.last_validated_at = Set(Some(two_hours_ago));
    active.update(harness.db.as_ref()).await.unwrap();

    let config = IncrementalValidationConfig {
        include_states: vec![KeyStatus::Invalid],
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let result = harness
        .service
        .validate_group(&cancel, group.id, config)
        .await
        .unwrap();

    assert_eq!(result.total_keys, 1);
    assert_eq!(result.validated_keys, 1);
    assert_eq!(result.successful_keys, 1);
    assert_eq!(result.failed_keys, 0);
    assert_eq!(result.key_results[0].old_status, "invalid");
    assert_eq!(result.key_results[0].new_status, "active");

    let updated = entity::api_keys::Entity::find_by_id(key.id)
        .one(harness.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, "active");
    let validated_at = updated.last_validated_at.unwrap();
    assert!(Utc::now().naive_utc() - validated_at < Duration::seconds(10));

    // 回到轮转列表
    assert_eq!(
        harness
            .store
            .rotate(&active_keys_key(group.id))
            .await
            .unwrap(),
        key.id.to_string()
    );
}

#[tokio::test]
async fn test_validator_marks_rejected_key_invalid() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async {
            (
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({"error": {"message": "bad key"}})),
            )
                .into_response()
        }),
    ))
    .await;

    let group = testing::insert_group_with(
        harness.db.as_ref(),
        "reject-group",
        "openai",
        json!({}),
        upstream,
    )
    .await;
    let key = testing::insert_key(harness.db.as_ref(), group.id, "sk-new", "pending", 0, 0).await;

    let cancel = CancellationToken::new();
    let result = harness
        .service
        .validate_group(&cancel, group.id, IncrementalValidationConfig::default())
        .await
        .unwrap();

    assert_eq!(result.validated_keys, 1);
    assert_eq!(result.failed_keys, 1);

    let updated = entity::api_keys::Entity::find_by_id(key.id)
        .one(harness.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, "invalid");
}

#[tokio::test]
async fn test_recently_validated_keys_are_excluded() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async { axum::Json(json!({"ok": true})).into_response() }),
    ))
    .await;

    let group = testing::insert_group_with(
        harness.db.as_ref(),
        "recent-group",
        "openai",
        json!({}),
        upstream,
    )
    .await;

    // 十分钟前刚校验过，默认一小时窗口内不再校验
    let key = testing::insert_key(harness.db.as_ref(), group.id, "sk-1", "invalid", 0, 0).await;
    let mut active: entity::api_keys::ActiveModel = key.into();
    active.last_validated_at = Set(Some(Utc::now().naive_utc() - Duration::minutes(10)));
    active.update(harness.db.as_ref()).await.unwrap();

    let cancel = CancellationToken::new();
    let result = harness
        .service
        .validate_group(&cancel, group.id, IncrementalValidationConfig::default())
        .await
        .unwrap();

    assert_eq!(result.total_keys, 0);
    assert_eq!(result.validated_keys, 0);
}

#[tokio::test]
async fn test_validate_all_groups_isolates_failures() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async { axum::Json(json!({"ok": true})).into_response() }),
    ))
    .await;

    testing::insert_group_with(
        harness.db.as_ref(),
        "group-a",
        "openai",
        json!({}),
        upstream.clone(),
    )
    .await;
    testing::insert_group_with(harness.db.as_ref(), "group-b", "openai", json!({}), upstream)
        .await;

    let cancel = CancellationToken::new();
    let results = harness
        .service
        .validate_all_groups(&cancel, IncrementalValidationConfig::default())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
}
