//! # 测试辅助模块
//!
//! 提供内存数据库和常用测试数据的构造函数，
//! 单元测试与集成测试共用。

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, Database, DatabaseConnection};
use serde_json::json;

/// 创建一个跑完迁移的内存数据库
///
/// # Panics
///
/// 数据库创建或迁移失败时 panic，测试环境下直接失败即可。
pub async fn setup_test_db() -> Arc<DatabaseConnection> {
    use migration::MigratorTrait;

    let db = Database::connect("sqlite::memory:")
        .await
        .expect("failed to create in-memory database");
    migration::Migrator::up(&db, None)
        .await
        .expect("failed to run migrations");
    Arc::new(db)
}

/// 插入一个使用默认配置的测试分组
pub async fn insert_group(db: &DatabaseConnection, name: &str) -> entity::groups::Model {
    insert_group_with(db, name, "openai", json!({}), "http://127.0.0.1:9".to_string()).await
}

/// 插入一个带配置覆盖和上游地址的测试分组
pub async fn insert_group_with(
    db: &DatabaseConnection,
    name: &str,
    channel_type: &str,
    config: serde_json::Value,
    upstream: String,
) -> entity::groups::Model {
    let now = Utc::now().naive_utc();
    let active = entity::groups::ActiveModel {
        name: Set(name.to_string()),
        display_name: Set(name.to_string()),
        proxy_keys: Set("local-proxy-key".to_string()),
        upstreams: Set(json!([upstream])),
        validation_endpoint: Set("/v1/chat/completions".to_string()),
        channel_type: Set(channel_type.to_string()),
        test_model: Set("gpt-4o-mini".to_string()),
        param_overrides: Set(json!({})),
        header_rules: Set(json!([])),
        config: Set(config),
        sort: Set(0),
        last_validated_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    active.insert(db).await.expect("failed to insert group")
}

/// 插入一个测试密钥
///
/// `key_value` 明文直存（测试默认使用透传加密），
/// `key_hash` 与明文一致。
pub async fn insert_key(
    db: &DatabaseConnection,
    group_id: i32,
    key_value: &str,
    status: &str,
    consecutive_failures: i64,
    backoff_level: i32,
) -> entity::api_keys::Model {
    let now = Utc::now().naive_utc();
    let active = entity::api_keys::ActiveModel {
        group_id: Set(group_id),
        key_value: Set(key_value.to_string()),
        key_hash: Set(key_value.to_string()),
        status: Set(status.to_string()),
        request_count: Set(0),
        failure_count: Set(0),
        consecutive_failures: Set(consecutive_failures),
        backoff_level: Set(backoff_level),
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
    active.insert(db).await.expect("failed to insert api key")
}

/// 不触库的分组解析结果，供纯函数测试使用
#[must_use]
pub fn group_info_fixture() -> crate::keypool::GroupInfo {
    let now = Utc::now().naive_utc();
    crate::keypool::GroupInfo {
        model: entity::groups::Model {
            id: 1,
            name: "test-group".to_string(),
            display_name: "test-group".to_string(),
            proxy_keys: "local-proxy-key".to_string(),
            upstreams: json!(["http://127.0.0.1:9"]),
            validation_endpoint: "/v1/chat/completions".to_string(),
            channel_type: "openai".to_string(),
            test_model: "gpt-4o-mini".to_string(),
            param_overrides: json!({}),
            header_rules: json!([]),
            config: json!({}),
            sort: 0,
            last_validated_at: None,
            created_at: now,
            updated_at: now,
        },
        upstreams: vec!["http://127.0.0.1:9".to_string()],
        header_rules: Vec::new(),
        proxy_keys: vec!["local-proxy-key".to_string()],
        effective_config: crate::config::SystemSettings::default(),
    }
}

/// 插入一条策略并关联到分组
pub async fn insert_group_policy(
    db: &DatabaseConnection,
    group_id: i32,
    name: &str,
    policy_type: &str,
    config: serde_json::Value,
    priority: i32,
) -> entity::policies::Model {
    let now = Utc::now().naive_utc();
    let policy = entity::policies::ActiveModel {
        name: Set(name.to_string()),
        description: Set(String::new()),
        policy_type: Set(policy_type.to_string()),
        config: Set(config),
        priority: Set(priority),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let policy = policy.insert(db).await.expect("failed to insert policy");

    let association = entity::group_policies::ActiveModel {
        group_id: Set(group_id),
        policy_id: Set(policy.id),
        priority: Set(priority),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    };
    association
        .insert(db)
        .await
        .expect("failed to insert group policy association");

    policy
}
