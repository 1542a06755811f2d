//! # 通道模块
//!
//! 把通用执行器适配到具体上游的线协议：URL 构造、鉴权注入、
//! 客户端选择和单密钥探测。执行器只依赖这里的 trait。

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicChannel;
pub use gemini::GeminiChannel;
pub use openai::OpenAiChannel;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;

use crate::error::{ProxyError, Result};
use crate::keypool::GroupInfo;

/// 通道代理接口
///
/// 执行器与校验器共用的最小面：构造上游 URL、注入上游鉴权、
/// 提供普通/流式客户端、探测单个密钥。
#[async_trait]
pub trait ChannelProxy: Send + Sync {
    /// 通道类型名，与分组的 `channel_type` 对应
    fn name(&self) -> &'static str;

    /// 基于剩余路径和查询串构造上游 URL
    fn build_upstream_url(
        &self,
        path: &str,
        query: Option<&str>,
        group: &GroupInfo,
    ) -> Result<String>;

    /// 注入上游鉴权头
    fn modify_request(
        &self,
        builder: RequestBuilder,
        api_key: &str,
        group: &GroupInfo,
    ) -> RequestBuilder;

    /// 普通请求客户端
    fn http_client(&self) -> &reqwest::Client;

    /// 流式请求客户端
    fn stream_client(&self) -> &reqwest::Client;

    /// 探测单个密钥
    ///
    /// `Ok(true)` 表示上游接受该凭证；`Ok(false)` 表示上游
    /// 明确拒绝；传输层失败返回错误（结论未知）。
    async fn validate_key(
        &self,
        api_key: &str,
        group: &GroupInfo,
        timeout: Duration,
    ) -> Result<bool>;
}

/// 通道注册表，按 `channel_type` 字符串分发
pub struct ChannelRegistry {
    channels: HashMap<&'static str, Arc<dyn ChannelProxy>>,
}

impl ChannelRegistry {
    /// 构建并注册全部内置通道
    pub fn new() -> Result<Self> {
        let mut channels: HashMap<&'static str, Arc<dyn ChannelProxy>> = HashMap::new();

        let openai: Arc<dyn ChannelProxy> = Arc::new(OpenAiChannel::new()?);
        channels.insert(openai.name(), openai);

        let anthropic: Arc<dyn ChannelProxy> = Arc::new(AnthropicChannel::new()?);
        channels.insert(anthropic.name(), anthropic);

        let gemini: Arc<dyn ChannelProxy> = Arc::new(GeminiChannel::new()?);
        channels.insert(gemini.name(), gemini);

        Ok(Self { channels })
    }

    /// 按通道类型取处理器
    pub fn get(&self, channel_type: &str) -> Result<Arc<dyn ChannelProxy>> {
        self.channels
            .get(channel_type)
            .cloned()
            .ok_or_else(|| ProxyError::not_found("channel", channel_type))
    }
}

/// 构建通道共用的 HTTP 客户端
///
/// 不设整体超时：非流式请求的超时由执行器按分组配置逐请求
/// 设置，流式请求只跟随客户端断开。
pub(crate) fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ProxyError::internal_with_source("failed to build HTTP client", e))
}

/// 拼接上游基础地址与剩余路径
pub(crate) fn join_upstream(base: &str, path: &str, query: Option<&str>) -> String {
    let trimmed_base = base.trim_end_matches('/');
    let trimmed_path = path.trim_start_matches('/');
    match query {
        Some(query) if !query.is_empty() => format!("{trimmed_base}/{trimmed_path}?{query}"),
        _ => format!("{trimmed_base}/{trimmed_path}"),
    }
}

/// 分组未配置上游时的统一错误
pub(crate) fn missing_upstream(group: &GroupInfo) -> ProxyError {
    ProxyError::config(format!(
        "group {} has no upstream configured",
        group.model.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_upstream() {
        assert_eq!(
            join_upstream("https://api.openai.com/", "/v1/chat/completions", None),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_upstream("https://api.openai.com", "v1/models", Some("limit=5")),
            "https://api.openai.com/v1/models?limit=5"
        );
        assert_eq!(
            join_upstream("https://api.openai.com", "v1/models", Some("")),
            "https://api.openai.com/v1/models"
        );
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = ChannelRegistry::new().unwrap();
        assert_eq!(registry.get("openai").unwrap().name(), "openai");
        assert_eq!(registry.get("anthropic").unwrap().name(), "anthropic");
        assert_eq!(registry.get("gemini").unwrap().name(), "gemini");
        assert!(registry.get("unknown").is_err());
    }
}
