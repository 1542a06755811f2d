//! # OpenAI 通道
//!
//! OpenAI 及兼容上游：Bearer 鉴权，探测走 chat completions

use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::json;

use super::{ChannelProxy, build_client, join_upstream, missing_upstream};
use crate::error::Result;
use crate::keypool::GroupInfo;

/// 默认探测端点
const DEFAULT_VALIDATION_ENDPOINT: &str = "/v1/chat/completions";

/// OpenAI 通道
pub struct OpenAiChannel {
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl OpenAiChannel {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            stream_client: build_client()?,
        })
    }
}

#[async_trait]
impl ChannelProxy for OpenAiChannel {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn build_upstream_url(
        &self,
        path: &str,
        query: Option<&str>,
        group: &GroupInfo,
    ) -> Result<String> {
        let base = group
            .primary_upstream()
            .ok_or_else(|| missing_upstream(group))?;
        Ok(join_upstream(base, path, query))
    }

    fn modify_request(
        &self,
        builder: RequestBuilder,
        api_key: &str,
        _group: &GroupInfo,
    ) -> RequestBuilder {
        builder.header("Authorization", format!("Bearer {api_key}"))
    }

    fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    fn stream_client(&self) -> &reqwest::Client {
        &self.stream_client
    }

    async fn validate_key(
        &self,
        api_key: &str,
        group: &GroupInfo,
        timeout: Duration,
    ) -> Result<bool> {
        let endpoint = if group.model.validation_endpoint.is_empty() {
            DEFAULT_VALIDATION_ENDPOINT
        } else {
            group.model.validation_endpoint.as_str()
        };
        let url = self.build_upstream_url(endpoint, None, group)?;

        let body = json!({
            "model": group.model.test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}
