//! # 密钥校验器
//!
//! 面向通道的探测层：解密密钥、发出小探测请求、回报结论。
//! 增量校验、定时检查和管理端批量测试都走这里。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::channel::ChannelRegistry;
use crate::encryption;
use crate::error::Result;
use crate::keypool::GroupInfo;
use crate::logging::{LogComponent, LogStage, sanitize_api_key};
use crate::{ldebug, lwarn};

/// 单个明文密钥的测试结论
#[derive(Debug, Clone, Serialize)]
pub struct KeyTestResult {
    /// 脱敏后的密钥
    pub key: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 密钥校验器
pub struct KeyValidator {
    channels: Arc<ChannelRegistry>,
    encryption: Arc<encryption::Service>,
}

impl KeyValidator {
    #[must_use]
    pub fn new(channels: Arc<ChannelRegistry>, encryption: Arc<encryption::Service>) -> Self {
        Self {
            channels,
            encryption,
        }
    }

    /// 探测一条已入库的密钥
    pub async fn validate_single_key(
        &self,
        key: &entity::api_keys::Model,
        group: &GroupInfo,
    ) -> Result<bool> {
        let plaintext = self.encryption.decrypt(&key.key_value)?;
        self.validate_raw_key(&plaintext, group).await
    }

    /// 探测一条明文密钥
    pub async fn validate_raw_key(&self, api_key: &str, group: &GroupInfo) -> Result<bool> {
        let channel = self.channels.get(&group.model.channel_type)?;
        let timeout = self.probe_timeout(group);

        let is_valid = channel.validate_key(api_key, group, timeout).await?;
        ldebug!(
            "system",
            LogStage::KeyValidation,
            LogComponent::Validator,
            "key_probe_finished",
            "Key probe finished",
            group = %group.model.name,
            key = %sanitize_api_key(api_key),
            is_valid = is_valid
        );
        Ok(is_valid)
    }

    /// 批量测试一组明文密钥，不触库
    pub async fn test_multiple_keys(
        &self,
        group: &GroupInfo,
        key_values: &[String],
    ) -> Vec<KeyTestResult> {
        let mut results = Vec::with_capacity(key_values.len());
        for key_value in key_values {
            let trimmed = key_value.trim();
            if trimmed.is_empty() {
                continue;
            }
            match self.validate_raw_key(trimmed, group).await {
                Ok(is_valid) => results.push(KeyTestResult {
                    key: sanitize_api_key(trimmed),
                    is_valid,
                    error: None,
                }),
                Err(err) => {
                    lwarn!(
                        "system",
                        LogStage::KeyValidation,
                        LogComponent::Validator,
                        "key_test_error",
                        "Key test failed with transport error",
                        group = %group.model.name,
                        key = %sanitize_api_key(trimmed),
                        error = %err
                    );
                    results.push(KeyTestResult {
                        key: sanitize_api_key(trimmed),
                        is_valid: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        results
    }

    /// 单次探测的超时时间，取分组生效配置
    fn probe_timeout(&self, group: &GroupInfo) -> Duration {
        let seconds = group
            .effective_config
            .key_validation_timeout_seconds
            .max(1);
        Duration::from_secs(seconds as u64)
    }
}
