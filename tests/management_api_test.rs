//! # 管理 API 集成测试
//!
//! 直接对管理路由发请求：认证、分组 CRUD、密钥操作、
//! 系统设置读写。

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use keyproxy::channel::ChannelRegistry;
use keyproxy::config::{AppConfig, SystemSettingsManager};
use keyproxy::encryption;
use keyproxy::keypool::{
    GroupManager, IncrementalValidationService, KeyPolicyHandler, KeyProvider, KeyStateService,
    KeyValidator,
};
use keyproxy::management::{ManagementState, management_router};
use keyproxy::policy::PolicyEngine;
use keyproxy::store::{MemoryStore, Store};
use keyproxy::testing;

const AUTH_KEY: &str = "test-admin-key";

fn test_app_config() -> AppConfig {
    AppConfig {
        server: keyproxy::config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3001,
        },
        auth_key: AUTH_KEY.to_string(),
        is_slave: false,
        log_level: None,
        cors: keyproxy::config::CorsConfig {
            enabled: false,
            allowed_origins: Vec::new(),
        },
        redis_dsn: String::new(),
        encryption_key: String::new(),
        database_dsn: String::new(),
        max_concurrent_requests: 100,
        graceful_shutdown_timeout: 10,
    }
}

async fn build_router() -> (Router, Arc<sea_orm::DatabaseConnection>) {
    let db = testing::setup_test_db().await;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let encryption = Arc::new(encryption::Service::new("").unwrap());
    let settings = Arc::new(SystemSettingsManager::new(
        Arc::clone(&db),
        Arc::clone(&store),
    ));
    settings.initialize(true).await.unwrap();

    let group_manager = Arc::new(GroupManager::new(
        Arc::clone(&db),
        Arc::clone(&store),
        Arc::clone(&settings),
    ));
    let channels = Arc::new(ChannelRegistry::new().unwrap());
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
    let validator = Arc::new(KeyValidator::new(channels, encryption));
    let incremental = Arc::new(IncrementalValidationService::new(
        Arc::clone(&db),
        Arc::clone(&store),
        Arc::clone(&validator),
        Arc::clone(&group_manager),
    ));

    let state = ManagementState {
        db: Arc::clone(&db),
        config: Arc::new(test_app_config()),
        settings,
        group_manager,
        provider,
        state_service,
        validator,
        incremental,
        policy_engine,
        validation_lock: Arc::new(tokio::sync::Mutex::new(())),
    };

    (management_router(state), db)
}

fn authed_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {AUTH_KEY}"));
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder
        .body(match body {
            Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
            None => Body::empty(),
        })
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_login_flow() {
    let (router, _db) = build_router().await;

    // 正确凭证
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({"auth_key": AUTH_KEY})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["token"], AUTH_KEY);

    // 错误凭证
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({"auth_key": "wrong"})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_protected_routes_require_auth() {
    let (router, _db) = build_router().await;

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/groups")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_group_crud() {
    let (router, _db) = build_router().await;

    // 创建
    let create = json!({
        "name": "openai-pool",
        "display_name": "OpenAI Pool",
        "proxy_keys": "proxy-key-1",
        "upstreams": ["https://api.openai.com"],
        "channel_type": "openai",
        "test_model": "gpt-4o-mini",
    });
    let response = router
        .clone()
        .oneshot(authed_request("POST", "/api/groups", Some(create.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let group_id = body["data"]["id"].as_i64().unwrap();

    // 同名冲突
    let response = router
        .clone()
        .oneshot(authed_request("POST", "/api/groups", Some(create)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // 读取
    let response = router
        .clone()
        .oneshot(authed_request(
            "GET",
            &format!("/api/groups/{group_id}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 校验失败：upstreams 为空
    let response = router
        .clone()
        .oneshot(authed_request(
            "POST",
            "/api/groups",
            Some(json!({"name": "bad", "upstreams": []})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // 删除
    let response = router
        .clone()
        .oneshot(authed_request(
            "DELETE",
            &format!("/api/groups/{group_id}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 删除后再取 404
    let response = router
        .oneshot(authed_request(
            "GET",
            &format!("/api/groups/{group_id}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_keys_add_and_list() {
    let (router, db) = build_router().await;
    let group = testing::insert_group(db.as_ref(), "key-group").await;

    let response = router
        .clone()
        .oneshot(authed_request(
            "POST",
            "/api/keys/add",
            Some(json!({
                "group_id": group.id,
                "keys_text": "sk-aaa\nsk-bbb\nsk-aaa",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["added"], 2);
    assert_eq!(body["data"]["ignored"], 1);

    let response = router
        .oneshot(authed_request(
            "GET",
            &format!("/api/keys?group_id={}", group.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["pagination"]["total"], 2);
}

#[tokio::test]
async fn test_settings_roundtrip() {
    let (router, _db) = build_router().await;

    let response = router
        .clone()
        .oneshot(authed_request("GET", "/api/settings", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["request_timeout"], 600);

    // 合法更新
    let response = router
        .clone()
        .oneshot(authed_request(
            "PUT",
            "/api/settings",
            Some(json!({"request_timeout": 120})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 非法键被拒绝
    let response = router
        .oneshot(authed_request(
            "PUT",
            "/api/settings",
            Some(json!({"no_such_key": 1})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
