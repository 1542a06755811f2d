//! # Gemini 通道
//!
//! x-goog-api-key 鉴权，探测走 models 列表

use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;

use super::{ChannelProxy, build_client, join_upstream, missing_upstream};
use crate::error::Result;
use crate::keypool::GroupInfo;

const DEFAULT_VALIDATION_ENDPOINT: &str = "/v1beta/models";

/// Gemini 通道
pub struct GeminiChannel {
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl GeminiChannel {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            stream_client: build_client()?,
        })
    }
}

#[async_trait]
impl ChannelProxy for GeminiChannel {
    fn name(&self) -> &'static str {
        "gemini"
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
        builder.header("x-goog-api-key", api_key)
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

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .header("x-goog-api-key", api_key)
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}
