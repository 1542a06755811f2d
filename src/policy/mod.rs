//! # 策略模块
//!
//! 声明式规则（条件 + 动作）决定失败如何处置、模型是否放行

mod engine;
mod types;

pub use engine::PolicyEngine;
pub use types::{
    DegradationPolicyConfig, DegradationRule, ModelFilterPolicyConfig, PolicyAction,
    PolicyConfigExt, PolicyEvaluationContext, PolicyEvaluationResult, PolicyType,
    RateLimitPolicyConfig, RetryPolicyConfig, RetryRule, RuleCondition, parse_duration,
};
