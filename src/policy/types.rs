//! # 策略类型定义
//!
//! 策略 `config` 列的各种形态以及评估上下文/结果

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// 策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyType {
    Retry,
    Degradation,
    ModelFilter,
    RateLimit,
}

impl PolicyType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Degradation => "degradation",
            Self::ModelFilter => "model_filter",
            Self::RateLimit => "rate_limit",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "retry" => Some(Self::Retry),
            "degradation" => Some(Self::Degradation),
            "model_filter" => Some(Self::ModelFilter),
            "rate_limit" => Some(Self::RateLimit),
            _ => None,
        }
    }
}

/// 策略动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Retry,
    Degrade,
    Disable,
    Invalidate,
}

impl PolicyAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Degrade => "degrade",
            Self::Disable => "disable",
            Self::Invalidate => "invalidate",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "retry" => Some(Self::Retry),
            "degrade" => Some(Self::Degrade),
            "disable" => Some(Self::Disable),
            "invalidate" => Some(Self::Invalidate),
            _ => None,
        }
    }
}

/// 规则条件
///
/// 同一规则内的所有条件按 AND 组合。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// status_code / error_message / error_type / model / failure_count / request_count
    #[serde(rename = "type")]
    pub condition_type: String,
    /// equals / contains / regex / in / not_in / gt / lt / gte / lte
    pub operator: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// 重试策略规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRule {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// retry / degrade / disable / invalidate
    pub action: String,
    #[serde(default)]
    pub max_retries: i64,
    #[serde(default)]
    pub backoff_ms: i64,
}

/// 重试策略配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default)]
    pub rules: Vec<RetryRule>,
}

/// 降级策略规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationRule {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// disable / invalidate
    pub action: String,
    /// 形如 "5m"、"1h"
    #[serde(default)]
    pub duration: String,
}

/// 降级策略配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DegradationPolicyConfig {
    #[serde(default)]
    pub rules: Vec<DegradationRule>,
}

/// 模型过滤策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFilterPolicyConfig {
    /// include / exclude
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// 限流策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicyConfig {
    pub limit: i64,
    /// 形如 "1s"、"1m"
    pub interval: String,
}

/// 策略评估上下文
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluationContext {
    pub group_id: i32,
    pub key_id: i64,
    pub model: String,
    pub status_code: i32,
    pub error_message: String,
    pub error_type: String,
    pub failure_count: i64,
    pub request_count: i64,
}

/// 策略评估结果
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluationResult {
    pub policy_id: i32,
    pub policy_name: String,
    pub rule_name: String,
    pub action: String,
    pub max_retries: i64,
    pub backoff_ms: i64,
    pub duration: String,
    pub priority: i32,
    pub reason: String,
    pub matched: bool,
}

/// 解析 "30s" / "5m" / "1h" 形式的时长
#[must_use]
pub fn parse_duration(raw: &str) -> Option<chrono::Duration> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return None;
    }
    let (amount, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = amount.parse().ok()?;
    if amount < 0 {
        return None;
    }
    match unit {
        "s" => Some(chrono::Duration::seconds(amount)),
        "m" => Some(chrono::Duration::minutes(amount)),
        "h" => Some(chrono::Duration::hours(amount)),
        _ => None,
    }
}

/// 策略配置解析扩展
pub trait PolicyConfigExt {
    fn retry_config(&self) -> Result<RetryPolicyConfig>;
    fn degradation_config(&self) -> Result<DegradationPolicyConfig>;
    fn model_filter_config(&self) -> Result<ModelFilterPolicyConfig>;
    fn rate_limit_config(&self) -> Result<RateLimitPolicyConfig>;
}

impl PolicyConfigExt for entity::policies::Model {
    fn retry_config(&self) -> Result<RetryPolicyConfig> {
        expect_type(self, PolicyType::Retry)?;
        Ok(serde_json::from_value(self.config.clone())?)
    }

    fn degradation_config(&self) -> Result<DegradationPolicyConfig> {
        expect_type(self, PolicyType::Degradation)?;
        Ok(serde_json::from_value(self.config.clone())?)
    }

    fn model_filter_config(&self) -> Result<ModelFilterPolicyConfig> {
        expect_type(self, PolicyType::ModelFilter)?;
        Ok(serde_json::from_value(self.config.clone())?)
    }

    fn rate_limit_config(&self) -> Result<RateLimitPolicyConfig> {
        expect_type(self, PolicyType::RateLimit)?;
        Ok(serde_json::from_value(self.config.clone())?)
    }
}

fn expect_type(policy: &entity::policies::Model, expected: PolicyType) -> Result<()> {
    if policy.policy_type == expected.as_str() {
        Ok(())
    } else {
        Err(ProxyError::validation(
            format!(
                "policy {} is of type '{}', expected '{}'",
                policy.name,
                policy.policy_type,
                expected.as_str()
            ),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_type_round_trip() {
        for policy_type in [
            PolicyType::Retry,
            PolicyType::Degradation,
            PolicyType::ModelFilter,
            PolicyType::RateLimit,
        ] {
            assert_eq!(PolicyType::parse(policy_type.as_str()), Some(policy_type));
        }
        assert_eq!(PolicyType::parse("unknown"), None);
    }

    #[test]
    fn test_retry_config_deserialization() {
        let config: RetryPolicyConfig = serde_json::from_value(json!({
            "rules": [{
                "name": "auth-failure",
                "priority": 1,
                "conditions": [{
                    "type": "status_code",
                    "operator": "in",
                    "values": ["401", "403"],
                }],
                "action": "invalidate",
            }]
        }))
        .unwrap();

        assert_eq!(config.rules.len(), 1);
        let rule = &config.rules[0];
        assert_eq!(rule.name, "auth-failure");
        assert_eq!(rule.action, "invalidate");
        assert_eq!(rule.conditions[0].values, vec!["401", "403"]);
        assert_eq!(rule.max_retries, 0);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(chrono::Duration::seconds(30)));
        assert_eq!(parse_duration("5m"), Some(chrono::Duration::minutes(5)));
        assert_eq!(parse_duration("1h"), Some(chrono::Duration::hours(1)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("-5m"), None);
    }

    #[test]
    fn test_config_ext_checks_type() {
        let policy = entity::policies::Model {
            id: 1,
            name: "p".to_string(),
            description: String::new(),
            policy_type: "retry".to_string(),
            config: json!({"rules": []}),
            priority: 0,
            is_active: true,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };

        assert!(policy.retry_config().is_ok());
        assert!(policy.degradation_config().is_err());
    }
}
