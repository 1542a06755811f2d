//! # 请求执行器端到端测试
//!
//! 用本地 mock 上游验证跨密钥重试、错误透传、流式转发
//! 和不计数错误的完整链路。

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::json;

use keyproxy::channel::ChannelRegistry;
use keyproxy::config::SystemSettings;
use keyproxy::encryption;
use keyproxy::keypool::{GroupInfo, KeyPolicyHandler, KeyProvider, KeyStateService};
use keyproxy::policy::PolicyEngine;
use keyproxy::proxy::{ProxyRequest, RequestExecutor, RequestLogService};
use keyproxy::store::{MemoryStore, Store};
use keyproxy::testing;

/// 启动一个 mock 上游，返回其基础地址
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

struct TestHarness {
    db: Arc<DatabaseConnection>,
    provider: Arc<KeyProvider>,
    executor: Arc<RequestExecutor>,
}

async fn build_harness() -> TestHarness {
    let db = testing::setup_test_db().await;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let encryption = Arc::new(encryption::Service::new("").unwrap());
    let engine = Arc::new(PolicyEngine::new(Arc::clone(&db)));
    let state_service = Arc::new(KeyStateService::new(Arc::clone(&db), Arc::clone(&store)));
    let handler = Arc::new(KeyPolicyHandler::new(engine, state_service));
    let provider = Arc::new(KeyProvider::new(
        Arc::clone(&db),
        Arc::clone(&store),
        encryption,
        handler,
    ));
    let channels = Arc::new(ChannelRegistry::new().unwrap());
    let request_log = Arc::new(RequestLogService::new(Arc::clone(&db)));
    let executor = Arc::new(RequestExecutor::new(
        Arc::clone(&provider),
        channels,
        request_log,
    ));

    TestHarness {
        db,
        provider,
        executor,
    }
}

fn group_info(model: entity::groups::Model, upstream: String, max_retries: i64) -> Arc<GroupInfo> {
    Arc::new(GroupInfo {
        model,
        upstreams: vec![upstream],
        header_rules: Vec::new(),
        proxy_keys: vec!["local-proxy-key".to_string()],
        effective_config: SystemSettings {
            max_retries,
            request_timeout: 10,
            ..SystemSettings::default()
        },
    })
}

fn chat_request(is_stream: bool) -> ProxyRequest {
    let body = json!({
        "model": "gpt-4o-mini",
        "stream": is_stream,
        "messages": [{"role": "user", "content": "hello"}],
    });
    ProxyRequest {
        request_id: "test-request".to_string(),
        method: Method::POST,
        path: "v1/chat/completions".to_string(),
        query: None,
        headers: HeaderMap::new(),
        body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        is_stream,
        model: "gpt-4o-mini".to_string(),
    }
}

async fn key_by_id(db: &DatabaseConnection, id: i64) -> entity::api_keys::Model {
    entity::api_keys::Entity::find_by_id(id)
        .one(db)
        .await
        .unwrap()
        .unwrap()
}

async fn final_logs(db: &DatabaseConnection, request_type: &str) -> u64 {
    use sea_orm::PaginatorTrait;
    entity::request_logs::Entity::find()
        .filter(entity::request_logs::Column::RequestType.eq(request_type))
        .count(db)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_retry_then_succeed_invalidates_bad_key() {
    let harness = build_harness().await;

    // K1 返回 401，K2 返回 200
    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|headers: HeaderMap| async move {
            let auth = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if auth == "Bearer sk-bad" {
                (
                    StatusCode::UNAUTHORIZED,
                    axum::Json(json!({"error": {"message": "Invalid API key provided"}})),
                )
                    .into_response()
            } else {
                axum::Json(json!({"choices": [{"message": {"content": "ok"}}]})).into_response()
            }
        }),
    ))
    .await;

    let group = testing::insert_group(harness.db.as_ref(), "retry-group").await;
    // 默认重试策略：401/403 直接判无效
    testing::insert_group_policy(
        harness.db.as_ref(),
        group.id,
        "default-retry",
        "retry",
        json!({
            "rules": [{
                "name": "auth-failure",
                "priority": 1,
                "conditions": [{
                    "type": "error_message",
                    "operator": "contains",
                    "value": "Invalid API key",
                }],
                "action": "invalidate",
            }]
        }),
        1,
    )
    .await;

    // lpush 逐个前插，后插入的密钥先被轮转选中：坏密钥排在第一个
    let k_good =
        testing::insert_key(harness.db.as_ref(), group.id, "sk-good", "active", 0, 0).await;
    let k_bad = testing::insert_key(harness.db.as_ref(), group.id, "sk-bad", "active", 0, 0).await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group, upstream, 3);
    let response = harness.executor.execute(info, chat_request(false)).await;
    assert_eq!(response.status(), StatusCode::OK);

    // 等待异步状态更新收敛
    tokio::time::sleep(Duration::from_millis(300)).await;

    let k_bad = key_by_id(harness.db.as_ref(), k_bad.id).await;
    let k_good = key_by_id(harness.db.as_ref(), k_good.id).await;
    assert_eq!(k_bad.status, "invalid");
    assert_eq!(k_good.status, "active");

    // 一条重试记录 + 一条最终记录
    assert_eq!(final_logs(harness.db.as_ref(), "retry").await, 1);
    assert_eq!(final_logs(harness.db.as_ref(), "final").await, 1);
}

#[tokio::test]
async fn test_exhaust_all_keys_returns_bad_gateway() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async {
            (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response()
        }),
    ))
    .await;

    let group = testing::insert_group(harness.db.as_ref(), "exhaust-group").await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-a", "active", 0, 0).await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-b", "active", 0, 0).await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group, upstream, 3);
    let response = harness.executor.execute(info, chat_request(false)).await;

    // 重试耗尽后包一层结构化 502
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "UPSTREAM_ERROR");

    tokio::time::sleep(Duration::from_millis(300)).await;

    // 三条重试 + 一条最终
    assert_eq!(final_logs(harness.db.as_ref(), "retry").await, 3);
    assert_eq!(final_logs(harness.db.as_ref(), "final").await, 1);

    // 两个密钥都吃到了失败
    let keys = entity::api_keys::Entity::find()
        .all(harness.db.as_ref())
        .await
        .unwrap();
    assert!(keys.iter().all(|k| k.consecutive_failures > 0));
}

#[tokio::test]
async fn test_streaming_preserves_headers_and_chunks() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async {
            let chunks = "data: one\n\ndata: two\n\ndata: [DONE]\n\n";
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from(chunks))
                .unwrap()
        }),
    ))
    .await;

    let group = testing::insert_group(harness.db.as_ref(), "stream-group").await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-stream", "active", 0, 0).await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group, upstream, 3);
    let response = harness.executor.execute(info, chat_request(true)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("data: one"));
    assert!(text.contains("data: two"));
    assert!(text.contains("data: [DONE]"));
}

#[tokio::test]
async fn test_uncounted_error_skips_state_but_still_retries() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|headers: HeaderMap| async move {
            let auth = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if auth == "Bearer sk-quota" {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(json!({"error": {"message": "resource has been exhausted"}})),
                )
                    .into_response()
            } else {
                axum::Json(json!({"ok": true})).into_response()
            }
        }),
    ))
    .await;

    let group = testing::insert_group(harness.db.as_ref(), "quota-group").await;
    // 后插入者先被选中：配额受限的密钥排在第一个
    testing::insert_key(harness.db.as_ref(), group.id, "sk-fine", "active", 0, 0).await;
    let quota_key =
        testing::insert_key(harness.db.as_ref(), group.id, "sk-quota", "active", 0, 0).await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group, upstream, 3);
    let response = harness.executor.execute(info, chat_request(false)).await;
    // 配额类错误不计数，但请求仍然换下一把密钥成功
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let quota_key = key_by_id(harness.db.as_ref(), quota_key.id).await;
    assert_eq!(quota_key.status, "active");
    assert_eq!(quota_key.consecutive_failures, 0);
}

#[tokio::test]
async fn test_no_keys_returns_service_unavailable() {
    let harness = build_harness().await;
    let group = testing::insert_group(harness.db.as_ref(), "empty-group").await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group, "http://127.0.0.1:9".to_string(), 3);
    let response = harness.executor.execute(info, chat_request(false)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_404_is_never_retried() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async { (StatusCode::NOT_FOUND, "no such model").into_response() }),
    ))
    .await;

    let group = testing::insert_group(harness.db.as_ref(), "notfound-group").await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-a", "active", 0, 0).await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-b", "active", 0, 0).await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group, upstream, 3);
    let response = harness.executor.execute(info, chat_request(false)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // 没有任何重试记录
    assert_eq!(final_logs(harness.db.as_ref(), "retry").await, 0);
    assert_eq!(final_logs(harness.db.as_ref(), "final").await, 1);
}

#[tokio::test]
async fn test_rotation_is_fair_across_requests() {
    let harness = build_harness().await;

    let upstream = spawn_upstream(Router::new().route(
        "/v1/chat/completions",
        any(|| async { axum::Json(json!({"ok": true})).into_response() }),
    ))
    .await;

    let group = testing::insert_group(harness.db.as_ref(), "fair-group").await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-1", "active", 0, 0).await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-2", "active", 0, 0).await;
    testing::insert_key(harness.db.as_ref(), group.id, "sk-3", "active", 0, 0).await;
    harness.provider.load_keys_from_db().await.unwrap();

    let info = group_info(group.clone(), upstream, 3);
    for _ in 0..6 {
        let response = harness
            .executor
            .execute(Arc::clone(&info), chat_request(false))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    tokio::time::sleep(Duration::from_millis(400)).await;

    // 6 次请求 3 把密钥：每把恰好使用 2 次
    let keys = entity::api_keys::Entity::find()
        .filter(entity::api_keys::Column::GroupId.eq(group.id))
        .all(harness.db.as_ref())
        .await
        .unwrap();
    for key in keys {
        assert_eq!(key.request_count, 2, "key {} usage", key.key_hash);
    }
}
