//! # 请求执行器
//!
//! 单次代理请求的编排：选密钥 → 构造上游请求 → 分发 →
//! 分类结果 → 跨密钥重试或收尾。重试预算来自分组生效配置。

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::read::GzDecoder;

use super::request_log::{
    REQUEST_TYPE_FINAL, REQUEST_TYPE_RETRY, RequestLogEntry, RequestLogService,
};
use crate::channel::{ChannelProxy, ChannelRegistry};
use crate::error::{ProxyError, is_ignorable_message, parse_upstream_error};
use crate::keypool::{GroupInfo, KeyProvider, SelectedKey};
use crate::logging::{LogComponent, LogStage, sanitize_api_key};
use crate::{ldebug, lerror, lwarn};

/// 客户端断开后使用的响应码，响应本身不会被送达
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// 一次代理请求的输入
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: Method,
    /// 分组名之后的剩余路径
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub is_stream: bool,
    pub model: String,
}

/// 单次上游尝试的分类结果
enum AttemptOutcome {
    Success(reqwest::Response),
    Failure {
        status_code: u16,
        error_body: Option<Bytes>,
        parsed_error: String,
        /// 客户端侧可忽略：不重试也不响应
        ignorable: bool,
        /// 由传输层错误产生
        transport: bool,
    },
}

/// 请求执行器
pub struct RequestExecutor {
    provider: Arc<KeyProvider>,
    channels: Arc<ChannelRegistry>,
    request_log: Arc<RequestLogService>,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(
        provider: Arc<KeyProvider>,
        channels: Arc<ChannelRegistry>,
        request_log: Arc<RequestLogService>,
    ) -> Self {
        Self {
            provider,
            channels,
            request_log,
        }
    }

    /// 执行一次代理请求，带跨密钥重试
    pub async fn execute(&self, group: Arc<GroupInfo>, request: ProxyRequest) -> Response {
        let start = Instant::now();
        let max_retries = group.effective_config.max_retries.max(0);

        let channel = match self.channels.get(&group.model.channel_type) {
            Ok(channel) => channel,
            Err(err) => {
                lerror!(
                    &request.request_id,
                    LogStage::RequestStart,
                    LogComponent::Executor,
                    "channel_resolve_failed",
                    "Unknown channel type for group",
                    group = %group.model.name,
                    error = %err
                );
                return ProxyError::internal(format!(
                    "unknown channel type: {}",
                    group.model.channel_type
                ))
                .into_response();
            }
        };

        let mut retry_count: i64 = 0;
        loop {
            // 1. 选密钥
            let api_key = match self.provider.select_key(group.model.id).await {
                Ok(key) => key,
                Err(err) => {
                    lerror!(
                        &request.request_id,
                        LogStage::RequestStart,
                        LogComponent::Executor,
                        "key_selection_failed",
                        "Failed to select a key for group",
                        group = %group.model.name,
                        attempt = retry_count + 1,
                        error = %err
                    );
                    self.log_attempt(
                        &group,
                        &request,
                        None,
                        start,
                        StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                        &err.to_string(),
                        false,
                        REQUEST_TYPE_FINAL,
                    );
                    return ProxyError::no_active_keys(err.to_string()).into_response();
                }
            };

            // 2. 构造上游 URL
            let upstream_url = match channel.build_upstream_url(
                &request.path,
                request.query.as_deref(),
                &group,
            ) {
                Ok(url) => url,
                Err(err) => {
                    lerror!(
                        &request.request_id,
                        LogStage::RequestModify,
                        LogComponent::Executor,
                        "upstream_url_failed",
                        "Failed to build upstream URL",
                        group = %group.model.name,
                        error = %err
                    );
                    return ProxyError::internal_with_source("failed to build upstream URL", err)
                        .into_response();
                }
            };

            // 3–5. 分发并分类
            let outcome = self
                .dispatch(channel.as_ref(), &group, &request, &api_key, &upstream_url)
                .await;

            match outcome {
                AttemptOutcome::Success(upstream_response) => {
                    ldebug!(
                        &request.request_id,
                        LogStage::Response,
                        LogComponent::Executor,
                        "attempt_succeeded",
                        "Request succeeded",
                        group = %group.model.name,
                        attempt = retry_count + 1,
                        key = %sanitize_api_key(&api_key.key_value)
                    );
                    self.provider.update_status(&api_key, &group, true, "");
                    let status = upstream_response.status().as_u16();
                    self.log_attempt(
                        &group,
                        &request,
                        Some(&api_key),
                        start,
                        status,
                        "",
                        true,
                        REQUEST_TYPE_FINAL,
                    );
                    return relay_response(upstream_response, request.is_stream);
                }
                AttemptOutcome::Failure {
                    status_code,
                    error_body,
                    parsed_error,
                    ignorable,
                    transport,
                } => {
                    let retryable = !ignorable && status_code != StatusCode::NOT_FOUND.as_u16();
                    let should_retry = retryable && retry_count < max_retries;

                    self.provider
                        .update_status(&api_key, &group, false, &parsed_error);

                    if should_retry {
                        ldebug!(
                            &request.request_id,
                            LogStage::ResponseFailure,
                            LogComponent::Executor,
                            "attempt_failed_retrying",
                            "Request failed, retrying with next key",
                            group = %group.model.name,
                            attempt = retry_count + 1,
                            max_retries = max_retries,
                            status_code = status_code,
                            key = %sanitize_api_key(&api_key.key_value),
                            parsed_error = %parsed_error
                        );
                        self.log_attempt(
                            &group,
                            &request,
                            Some(&api_key),
                            start,
                            status_code,
                            &parsed_error,
                            false,
                            REQUEST_TYPE_RETRY,
                        );
                        retry_count += 1;
                        continue;
                    }

                    lwarn!(
                        &request.request_id,
                        LogStage::ResponseFailure,
                        LogComponent::Executor,
                        "attempt_failed_terminal",
                        "Request failed terminally",
                        group = %group.model.name,
                        attempt = retry_count + 1,
                        status_code = status_code,
                        ignorable = ignorable,
                        parsed_error = %parsed_error
                    );
                    self.log_attempt(
                        &group,
                        &request,
                        Some(&api_key),
                        start,
                        status_code,
                        &parsed_error,
                        false,
                        REQUEST_TYPE_FINAL,
                    );

                    if ignorable {
                        // 客户端已断开，静默返回
                        return Response::builder()
                            .status(
                                StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                                    .unwrap_or(StatusCode::BAD_GATEWAY),
                            )
                            .body(Body::empty())
                            .unwrap_or_default();
                    }

                    return terminal_error_response(
                        status_code,
                        error_body,
                        &parsed_error,
                        transport || retryable,
                    );
                }
            }
        }
    }

    /// 构造、发送上游请求并分类结果
    async fn dispatch(
        &self,
        channel: &dyn ChannelProxy,
        group: &GroupInfo,
        request: &ProxyRequest,
        api_key: &SelectedKey,
        upstream_url: &str,
    ) -> AttemptOutcome {
        let client = if request.is_stream {
            channel.stream_client()
        } else {
            channel.http_client()
        };

        let mut builder = client
            .request(request.method.clone(), upstream_url)
            .headers(clean_client_headers(&request.headers));

        // 非流式请求带分组级超时；流式请求只跟随客户端断开
        if !request.is_stream {
            let timeout_secs = group.effective_config.request_timeout.max(1) as u64;
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }

        builder = channel.modify_request(builder, &api_key.key_value, group);
        builder = builder.body(request.body.clone());

        let mut upstream_request = match builder.build() {
            Ok(req) => req,
            Err(err) => {
                return AttemptOutcome::Failure {
                    status_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    error_body: None,
                    parsed_error: format!("failed to build upstream request: {err}"),
                    ignorable: false,
                    transport: true,
                };
            }
        };

        apply_header_rules(upstream_request.headers_mut(), group);
        if request.is_stream {
            upstream_request
                .headers_mut()
                .insert("x-accel-buffering", HeaderValue::from_static("no"));
        }

        let response = match client.execute(upstream_request).await {
            Ok(response) => response,
            Err(err) => {
                let text = error_chain_text(&err);
                return AttemptOutcome::Failure {
                    status_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    error_body: None,
                    parsed_error: text.clone(),
                    ignorable: is_ignorable_message(&text),
                    transport: true,
                };
            }
        };

        let status = response.status();
        if status.as_u16() < 400 {
            return AttemptOutcome::Success(response);
        }

        // 错误响应：读出完整 body 用于解析，gzip 先解压
        let gzip = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));
        let raw_body = response.bytes().await.unwrap_or_default();
        let decoded = if gzip {
            decompress_gzip(&raw_body)
        } else {
            raw_body
        };
        let parsed_error = parse_upstream_error(&decoded);

        AttemptOutcome::Failure {
            status_code: status.as_u16(),
            error_body: Some(decoded),
            parsed_error,
            ignorable: false,
            transport: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_attempt(
        &self,
        group: &GroupInfo,
        request: &ProxyRequest,
        api_key: Option<&SelectedKey>,
        start: Instant,
        status_code: u16,
        error_message: &str,
        is_success: bool,
        request_type: &'static str,
    ) {
        self.request_log.record(RequestLogEntry {
            group_id: group.model.id,
            key_hash: api_key.map(|k| k.key_hash.clone()).unwrap_or_default(),
            model: request.model.clone(),
            is_success,
            status_code: i32::from(status_code),
            request_path: request.path.clone(),
            duration_ms: start.elapsed().as_millis() as i64,
            error_message: error_message.to_string(),
            request_type,
        });
    }
}

/// 终局错误响应
///
/// 上游 body 是合法 JSON 时原样透传并保留上游状态码；
/// 否则包一层结构化错误。重试耗尽或传输层失败按 502 处理。
fn terminal_error_response(
    status_code: u16,
    error_body: Option<Bytes>,
    parsed_error: &str,
    exhausted_or_transport: bool,
) -> Response {
    if let Some(body) = error_body {
        if serde_json::from_slice::<serde_json::Value>(&body).is_ok() {
            return Response::builder()
                .status(StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_default();
        }
    }

    let effective_status = if exhausted_or_transport {
        StatusCode::BAD_GATEWAY.as_u16()
    } else {
        status_code
    };
    ProxyError::upstream(effective_status, parsed_error).into_response()
}

/// 把上游响应转成客户端响应
///
/// 响应体逐块转发，逐跳头不转发；流式响应去掉 content-length。
fn relay_response(upstream: reqwest::Response, is_stream: bool) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if is_stream && name == header::CONTENT_LENGTH {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_default()
}

/// 清理客户端请求头
///
/// 客户端凭证绝不向上游转发；逐跳头交给 HTTP 客户端自理。
fn clean_client_headers(headers: &HeaderMap) -> HeaderMap {
    let mut cleaned = headers.clone();
    for name in [
        "authorization",
        "x-api-key",
        "x-goog-api-key",
        "host",
        "content-length",
        "connection",
        "transfer-encoding",
    ] {
        cleaned.remove(name);
    }
    cleaned
}

/// 应用分组的请求头改写规则
fn apply_header_rules(headers: &mut HeaderMap, group: &GroupInfo) {
    for rule in &group.header_rules {
        let Ok(name) = rule.key.parse::<axum::http::HeaderName>() else {
            continue;
        };
        match rule.action.as_str() {
            "remove" => {
                headers.remove(&name);
            }
            _ => {
                if let Ok(value) = HeaderValue::from_str(&rule.value) {
                    headers.insert(name, value);
                }
            }
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// 串起错误链上的全部消息，供可忽略性判断使用
fn error_chain_text(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

fn decompress_gzip(body: &Bytes) -> Bytes {
    let mut decoder = GzDecoder::new(body.as_ref());
    let mut decompressed = Vec::new();
    if decoder.read_to_end(&mut decompressed).is_ok() {
        Bytes::from(decompressed)
    } else {
        body.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_client_headers_strips_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("secret"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let cleaned = clean_client_headers(&headers);
        assert!(cleaned.get("authorization").is_none());
        assert!(cleaned.get("x-api-key").is_none());
        assert!(cleaned.get("x-goog-api-key").is_none());
        assert_eq!(
            cleaned.get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_apply_header_rules() {
        let mut group = crate::testing::group_info_fixture();
        group.header_rules = vec![
            crate::keypool::HeaderRule {
                key: "X-Custom".to_string(),
                value: "custom-value".to_string(),
                action: "set".to_string(),
            },
            crate::keypool::HeaderRule {
                key: "X-Drop".to_string(),
                value: String::new(),
                action: "remove".to_string(),
            },
        ];

        let mut headers = HeaderMap::new();
        headers.insert("x-drop", HeaderValue::from_static("should-go"));
        apply_header_rules(&mut headers, &group);

        assert_eq!(headers.get("x-custom").unwrap(), "custom-value");
        assert!(headers.get("x-drop").is_none());
    }

    #[test]
    fn test_terminal_error_response_passthrough_json() {
        let body = Bytes::from_static(br#"{"error": {"message": "quota exceeded"}}"#);
        let response =
            terminal_error_response(429, Some(body), "quota exceeded", false);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_terminal_error_response_wraps_non_json() {
        let body = Bytes::from_static(b"upstream exploded");
        let response = terminal_error_response(500, Some(body), "upstream exploded", true);
        // 重试耗尽后按 502 返回结构化错误
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_gzip_decompression() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed error body").unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());

        assert_eq!(
            decompress_gzip(&compressed),
            Bytes::from_static(b"compressed error body")
        );
        // 非 gzip 数据原样返回
        let plain = Bytes::from_static(b"plain");
        assert_eq!(decompress_gzip(&plain), plain);
    }
}
