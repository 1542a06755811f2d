//! # 代理入口
//!
//! `ANY /proxy/{group_name}/*path`：本地代理密钥认证 →
//! 模型过滤 → 交给执行器转发。

use std::sync::Arc;

use axum::Router;
use axum::body::to_bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use uuid::Uuid;

use super::executor::{ProxyRequest, RequestExecutor};
use crate::error::ProxyError;
use crate::keypool::GroupManager;
use crate::logging::{LogComponent, LogStage};
use crate::policy::PolicyEngine;
use crate::{ldebug, linfo};

/// 请求体大小上限
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// 代理面共享状态
#[derive(Clone)]
pub struct ProxyState {
    pub group_manager: Arc<GroupManager>,
    pub policy_engine: Arc<PolicyEngine>,
    pub executor: Arc<RequestExecutor>,
}

/// 构建代理路由
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/proxy/{group_name}/{*path}", any(handle_proxy))
        .with_state(state)
}

async fn handle_proxy(
    State(state): State<ProxyState>,
    Path((group_name, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let query = request.uri().query().map(ToString::to_string);
    let headers = request.headers().clone();

    let group = match state.group_manager.get_by_name(&group_name).await {
        Ok(group) => group,
        Err(err) => return err.into_response(),
    };

    // 本地代理密钥认证
    let candidate = extract_proxy_key(&headers, query.as_deref());
    if !group.allows_proxy_key(&candidate) {
        return ProxyError::auth("invalid or missing proxy key").into_response();
    }

    let body = match to_bytes(request.into_body(), MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(err) => {
            return ProxyError::validation(format!("failed to read request body: {err}"), None)
                .into_response();
        }
    };

    let (model, is_stream) = inspect_body(&body, &path, query.as_deref());

    if group.effective_config.enable_request_body_logging && !body.is_empty() {
        let preview_len = body.len().min(2048);
        ldebug!(
            &request_id,
            LogStage::RequestStart,
            LogComponent::Proxy,
            "request_body_preview",
            "Request body preview",
            group = %group_name,
            body_preview = %String::from_utf8_lossy(&body[..preview_len])
        );
    }

    // 模型过滤策略
    if !model.is_empty() {
        match state
            .policy_engine
            .evaluate_model_filter(group.model.id, &model)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return ProxyError::forbidden(format!("model {model} is not allowed"))
                    .into_response();
            }
            // 策略评估失败不拦截请求
            Err(_) => {}
        }
    }

    linfo!(
        &request_id,
        LogStage::RequestStart,
        LogComponent::Proxy,
        "proxy_request",
        "Proxying request",
        group = %group_name,
        method = %method,
        path = %path,
        model = %model,
        is_stream = is_stream
    );

    state
        .executor
        .execute(
            group,
            ProxyRequest {
                request_id,
                method,
                path,
                query,
                headers,
                body,
                is_stream,
                model,
            },
        )
        .await
}

/// 提取客户端出示的本地代理密钥
///
/// 依次尝试 `Authorization: Bearer`、`X-Api-Key`、
/// `X-Goog-Api-Key` 和查询参数 `key`。
fn extract_proxy_key(headers: &HeaderMap, query: Option<&str>) -> String {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return token.trim().to_string();
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.trim().to_string();
            }
        }
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("key=") {
                return value.trim().to_string();
            }
        }
    }

    String::new()
}

/// 从请求体和路径里识别模型名与流式标记
fn inspect_body(body: &[u8], path: &str, query: Option<&str>) -> (String, bool) {
    let mut model = String::new();
    let mut is_stream = false;

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(name) = value.get("model").and_then(|v| v.as_str()) {
            model = name.to_string();
        }
        if value.get("stream").and_then(serde_json::Value::as_bool) == Some(true) {
            is_stream = true;
        }
    }

    // Gemini 风格：模型在路径里，流式方法名带 stream 前缀
    if model.is_empty() {
        if let Some(rest) = path.split("models/").nth(1) {
            let name: String = rest
                .chars()
                .take_while(|c| *c != ':' && *c != '/')
                .collect();
            model = name;
        }
    }
    if path.contains("streamGenerateContent") {
        is_stream = true;
    }
    if query.is_some_and(|q| q.split('&').any(|pair| pair == "alt=sse")) {
        is_stream = true;
    }

    (model, is_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_proxy_key_sources() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-1"),
        );
        assert_eq!(extract_proxy_key(&headers, None), "token-1");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("token-2"));
        assert_eq!(extract_proxy_key(&headers, None), "token-2");

        let headers = HeaderMap::new();
        assert_eq!(extract_proxy_key(&headers, Some("key=token-3")), "token-3");
        assert_eq!(extract_proxy_key(&headers, None), "");
    }

    #[test]
    fn test_inspect_body_openai_style() {
        let body = br#"{"model": "gpt-4o", "stream": true, "messages": []}"#;
        let (model, is_stream) = inspect_body(body, "v1/chat/completions", None);
        assert_eq!(model, "gpt-4o");
        assert!(is_stream);

        let body = br#"{"model": "gpt-4o-mini"}"#;
        let (model, is_stream) = inspect_body(body, "v1/chat/completions", None);
        assert_eq!(model, "gpt-4o-mini");
        assert!(!is_stream);
    }

    #[test]
    fn test_inspect_body_gemini_style() {
        let (model, is_stream) = inspect_body(
            b"{}",
            "v1beta/models/gemini-pro:streamGenerateContent",
            Some("alt=sse"),
        );
        assert_eq!(model, "gemini-pro");
        assert!(is_stream);

        let (model, is_stream) =
            inspect_body(b"{}", "v1beta/models/gemini-pro:generateContent", None);
        assert_eq!(model, "gemini-pro");
        assert!(!is_stream);
    }
}
