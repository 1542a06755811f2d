//! # 管理端路由装配

use axum::routing::{delete, get, post, put};
use axum::{Router, middleware};

use super::handlers;
use super::middleware::require_auth;
use super::state::ManagementState;

/// 构建管理端路由
pub fn management_router(state: ManagementState) -> Router {
    let authed = Router::new()
        .route("/api/groups", get(handlers::groups::list_groups))
        .route("/api/groups", post(handlers::groups::create_group))
        .route("/api/groups/list", get(handlers::groups::list_groups))
        .route(
            "/api/groups/config-options",
            get(handlers::groups::config_options),
        )
        .route("/api/groups/{id}", get(handlers::groups::get_group))
        .route("/api/groups/{id}", put(handlers::groups::update_group))
        .route("/api/groups/{id}", delete(handlers::groups::delete_group))
        .route("/api/groups/{id}/stats", get(handlers::groups::group_stats))
        .route("/api/groups/{id}/copy", post(handlers::groups::copy_group))
        .route("/api/keys", get(handlers::keys::list_keys))
        .route("/api/keys/add", post(handlers::keys::add_keys))
        .route("/api/keys/delete", post(handlers::keys::delete_keys))
        .route("/api/keys/restore", post(handlers::keys::restore_keys))
        .route(
            "/api/keys/restore-all-invalid",
            post(handlers::keys::restore_all_invalid),
        )
        .route(
            "/api/keys/clear-invalid",
            post(handlers::keys::clear_invalid),
        )
        .route("/api/keys/clear-all", post(handlers::keys::clear_all))
        .route(
            "/api/keys/test-multiple/{group_id}",
            post(handlers::keys::test_multiple),
        )
        .route(
            "/api/validation/groups",
            post(handlers::validation::validate_all_groups),
        )
        .route(
            "/api/validation/groups/{id}",
            post(handlers::validation::validate_group),
        )
        .route(
            "/api/validation/groups/{id}/history",
            get(handlers::validation::validation_history),
        )
        .route("/api/settings", get(handlers::settings::get_settings))
        .route("/api/settings", put(handlers::settings::update_settings))
        .route("/api/dashboard/overview", get(handlers::dashboard::overview))
        .route("/api/logs", get(handlers::logs::list_logs))
        .route("/api/logs/export", get(handlers::logs::export_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .merge(authed)
        .with_state(state)
}
