//! # 策略引擎
//!
//! 按分组评估策略：规则内条件 AND，规则按优先级取首个命中，
//! 跨策略按关联优先级取首个产生命中的策略。

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio::sync::RwLock;

use super::types::{
    PolicyConfigExt, PolicyEvaluationContext, PolicyEvaluationResult, PolicyType, RuleCondition,
};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 分组策略及其关联优先级
#[derive(Debug, Clone)]
struct GroupPolicy {
    association_priority: i32,
    policy: entity::policies::Model,
}

/// 策略引擎
pub struct PolicyEngine {
    db: Arc<DatabaseConnection>,
    /// group_id → 已按关联优先级排序的活跃策略
    cache: RwLock<HashMap<i32, Arc<Vec<GroupPolicy>>>>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 清空策略缓存，策略或关联变更后调用
    pub async fn invalidate_cache(&self) {
        self.cache.write().await.clear();
    }

    /// 评估重试策略，返回首个命中的结果
    pub async fn evaluate_retry_policies(
        &self,
        group_id: i32,
        context: &PolicyEvaluationContext,
    ) -> Result<Option<PolicyEvaluationResult>> {
        let policies = self.group_policies_by_type(group_id, PolicyType::Retry).await?;

        for group_policy in policies.iter() {
            let config = match group_policy.policy.retry_config() {
                Ok(config) => config,
                Err(err) => {
                    lwarn!(
                        "system",
                        LogStage::Scheduling,
                        LogComponent::PolicyEngine,
                        "retry_config_invalid",
                        "Skipping retry policy with invalid config",
                        policy = %group_policy.policy.name,
                        error = %err
                    );
                    continue;
                }
            };

            let mut rules = config.rules;
            rules.sort_by_key(|rule| rule.priority);

            for rule in rules {
                if evaluate_conditions(&rule.conditions, context) {
                    return Ok(Some(PolicyEvaluationResult {
                        policy_id: group_policy.policy.id,
                        policy_name: group_policy.policy.name.clone(),
                        rule_name: rule.name.clone(),
                        action: rule.action,
                        max_retries: rule.max_retries,
                        backoff_ms: rule.backoff_ms,
                        duration: String::new(),
                        priority: group_policy.association_priority,
                        reason: format!("Matched rule: {}", rule.name),
                        matched: true,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// 评估降级策略，返回首个命中的结果
    pub async fn evaluate_degradation_policies(
        &self,
        group_id: i32,
        context: &PolicyEvaluationContext,
    ) -> Result<Option<PolicyEvaluationResult>> {
        let policies = self
            .group_policies_by_type(group_id, PolicyType::Degradation)
            .await?;

        for group_policy in policies.iter() {
            let config = match group_policy.policy.degradation_config() {
                Ok(config) => config,
                Err(err) => {
                    lwarn!(
                        "system",
                        LogStage::Scheduling,
                        LogComponent::PolicyEngine,
                        "degradation_config_invalid",
                        "Skipping degradation policy with invalid config",
                        policy = %group_policy.policy.name,
                        error = %err
                    );
                    continue;
                }
            };

            let mut rules = config.rules;
            rules.sort_by_key(|rule| rule.priority);

            for rule in rules {
                if evaluate_conditions(&rule.conditions, context) {
                    return Ok(Some(PolicyEvaluationResult {
                        policy_id: group_policy.policy.id,
                        policy_name: group_policy.policy.name.clone(),
                        rule_name: rule.name.clone(),
                        action: rule.action,
                        max_retries: 0,
                        backoff_ms: 0,
                        duration: rule.duration,
                        priority: group_policy.association_priority,
                        reason: format!("Matched degradation rule: {}", rule.name),
                        matched: true,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// 评估模型过滤策略
    ///
    /// 多个过滤策略按 AND 组合：任何一个拒绝即拒绝。
    pub async fn evaluate_model_filter(&self, group_id: i32, model: &str) -> Result<bool> {
        let policies = self
            .group_policies_by_type(group_id, PolicyType::ModelFilter)
            .await?;

        for group_policy in policies.iter() {
            let config = match group_policy.policy.model_filter_config() {
                Ok(config) => config,
                Err(err) => {
                    lwarn!(
                        "system",
                        LogStage::Scheduling,
                        LogComponent::PolicyEngine,
                        "model_filter_config_invalid",
                        "Skipping model filter policy with invalid config",
                        policy = %group_policy.policy.name,
                        error = %err
                    );
                    continue;
                }
            };

            let mut matched = false;
            for pattern in &config.patterns {
                match Regex::new(pattern) {
                    Ok(regex) => {
                        if regex.is_match(model) {
                            matched = true;
                            break;
                        }
                    }
                    Err(err) => {
                        lwarn!(
                            "system",
                            LogStage::Scheduling,
                            LogComponent::PolicyEngine,
                            "model_filter_bad_pattern",
                            "Invalid regex pattern in model filter policy",
                            policy = %group_policy.policy.name,
                            pattern = %pattern,
                            error = %err
                        );
                    }
                }
            }

            // 命中时：include 放行，exclude 拒绝
            // 未命中时：include 默认拒绝，exclude 默认放行
            let allowed = if matched {
                config.filter_type == "include"
            } else {
                config.filter_type != "include"
            };

            if !allowed {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// 评估限流策略
    ///
    /// 占位实现：配置解析校验，但总是返回不命中。
    pub async fn evaluate_rate_limit_policies(
        &self,
        group_id: i32,
        _context: &PolicyEvaluationContext,
    ) -> Result<Option<PolicyEvaluationResult>> {
        let policies = self
            .group_policies_by_type(group_id, PolicyType::RateLimit)
            .await?;

        for group_policy in policies.iter() {
            if let Err(err) = group_policy.policy.rate_limit_config() {
                lwarn!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::PolicyEngine,
                    "rate_limit_config_invalid",
                    "Rate limit policy has invalid config",
                    policy = %group_policy.policy.name,
                    error = %err
                );
            }
        }

        Ok(None)
    }

    /// 获取分组内指定类型的活跃策略，按关联优先级升序
    async fn group_policies_by_type(
        &self,
        group_id: i32,
        policy_type: PolicyType,
    ) -> Result<Vec<GroupPolicy>> {
        let all = self.load_group_policies(group_id).await?;
        Ok(all
            .iter()
            .filter(|gp| gp.policy.policy_type == policy_type.as_str())
            .cloned()
            .collect())
    }

    /// 加载并缓存分组的全部活跃策略
    async fn load_group_policies(&self, group_id: i32) -> Result<Arc<Vec<GroupPolicy>>> {
        {
            let cache = self.cache.read().await;
            if let Some(policies) = cache.get(&group_id) {
                return Ok(Arc::clone(policies));
            }
        }

        let associations = entity::group_policies::Entity::find()
            .filter(entity::group_policies::Column::GroupId.eq(group_id))
            .filter(entity::group_policies::Column::IsActive.eq(true))
            .all(self.db.as_ref())
            .await?;

        let policy_ids: Vec<i32> = associations.iter().map(|a| a.policy_id).collect();
        let policies = if policy_ids.is_empty() {
            Vec::new()
        } else {
            entity::policies::Entity::find()
                .filter(entity::policies::Column::Id.is_in(policy_ids))
                .filter(entity::policies::Column::IsActive.eq(true))
                .all(self.db.as_ref())
                .await?
        };

        let policy_by_id: HashMap<i32, entity::policies::Model> =
            policies.into_iter().map(|p| (p.id, p)).collect();

        let mut group_policies: Vec<GroupPolicy> = associations
            .into_iter()
            .filter_map(|assoc| {
                policy_by_id.get(&assoc.policy_id).map(|policy| GroupPolicy {
                    association_priority: assoc.priority,
                    policy: policy.clone(),
                })
            })
            .collect();
        group_policies.sort_by_key(|gp| gp.association_priority);

        let shared = Arc::new(group_policies);
        self.cache.write().await.insert(group_id, Arc::clone(&shared));
        Ok(shared)
    }
}

/// 评估条件列表，空列表视为命中
fn evaluate_conditions(conditions: &[RuleCondition], context: &PolicyEvaluationContext) -> bool {
    conditions
        .iter()
        .all(|condition| evaluate_condition(condition, context))
}

/// 评估单个条件
fn evaluate_condition(condition: &RuleCondition, context: &PolicyEvaluationContext) -> bool {
    let actual = match condition.condition_type.as_str() {
        "status_code" => context.status_code.to_string(),
        "error_message" => context.error_message.clone(),
        "error_type" => context.error_type.clone(),
        "model" => context.model.clone(),
        "failure_count" => context.failure_count.to_string(),
        "request_count" => context.request_count.to_string(),
        _ => return false,
    };

    match condition.operator.as_str() {
        "equals" => actual == condition.value,
        "contains" => actual.contains(&condition.value),
        "regex" => match Regex::new(&condition.value) {
            Ok(regex) => regex.is_match(&actual),
            Err(err) => {
                lwarn!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::PolicyEngine,
                    "condition_bad_regex",
                    "Invalid regex in policy condition",
                    pattern = %condition.value,
                    error = %err
                );
                false
            }
        },
        "in" => condition.values.iter().any(|v| *v == actual),
        "not_in" => !condition.values.iter().any(|v| *v == actual),
        "gt" => compare_numeric(&actual, &condition.value, |a, b| a > b),
        "lt" => compare_numeric(&actual, &condition.value, |a, b| a < b),
        "gte" => compare_numeric(&actual, &condition.value, |a, b| a >= b),
        "lte" => compare_numeric(&actual, &condition.value, |a, b| a <= b),
        _ => false,
    }
}

/// 数值比较：两侧都按浮点解析，任一侧失败即不命中
fn compare_numeric(actual: &str, expected: &str, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => cmp(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(condition_type: &str, operator: &str, value: &str) -> RuleCondition {
        RuleCondition {
            condition_type: condition_type.to_string(),
            operator: operator.to_string(),
            value: value.to_string(),
            values: Vec::new(),
        }
    }

    fn context() -> PolicyEvaluationContext {
        PolicyEvaluationContext {
            group_id: 1,
            key_id: 7,
            model: "gpt-4o-mini".to_string(),
            status_code: 429,
            error_message: "rate limit exceeded".to_string(),
            error_type: "rate_limit_error".to_string(),
            failure_count: 5,
            request_count: 100,
        }
    }

    #[test]
    fn test_equals_and_contains() {
        let ctx = context();
        assert!(evaluate_condition(
            &condition("status_code", "equals", "429"),
            &ctx
        ));
        assert!(!evaluate_condition(
            &condition("status_code", "equals", "500"),
            &ctx
        ));
        assert!(evaluate_condition(
            &condition("error_message", "contains", "rate limit"),
            &ctx
        ));
    }

    #[test]
    fn test_regex_operator() {
        let ctx = context();
        assert!(evaluate_condition(
            &condition("model", "regex", "^gpt-4o"),
            &ctx
        ));
        // 非法正则不命中
        assert!(!evaluate_condition(
            &condition("model", "regex", "("),
            &ctx
        ));
    }

    #[test]
    fn test_in_not_in() {
        let ctx = context();
        let mut cond = condition("status_code", "in", "");
        cond.values = vec!["401".to_string(), "429".to_string()];
        assert!(evaluate_condition(&cond, &ctx));

        cond.operator = "not_in".to_string();
        assert!(!evaluate_condition(&cond, &ctx));
    }

    #[test]
    fn test_numeric_operators() {
        let ctx = context();
        assert!(evaluate_condition(
            &condition("failure_count", "gte", "5"),
            &ctx
        ));
        assert!(evaluate_condition(
            &condition("failure_count", "gt", "4"),
            &ctx
        ));
        assert!(!evaluate_condition(
            &condition("failure_count", "lt", "5"),
            &ctx
        ));
        assert!(evaluate_condition(
            &condition("request_count", "lte", "100"),
            &ctx
        ));
        // 非数值两侧不命中
        assert!(!evaluate_condition(
            &condition("error_message", "gt", "10"),
            &ctx
        ));
    }

    #[test]
    fn test_unknown_type_and_operator() {
        let ctx = context();
        assert!(!evaluate_condition(&condition("no_such", "equals", "x"), &ctx));
        assert!(!evaluate_condition(
            &condition("status_code", "no_such_op", "429"),
            &ctx
        ));
    }

    #[test]
    fn test_empty_conditions_match() {
        assert!(evaluate_conditions(&[], &context()));
    }

    #[test]
    fn test_conditions_are_anded() {
        let ctx = context();
        let both = [
            condition("status_code", "equals", "429"),
            condition("error_message", "contains", "rate limit"),
        ];
        assert!(evaluate_conditions(&both, &ctx));

        let one_fails = [
            condition("status_code", "equals", "429"),
            condition("error_message", "contains", "quota"),
        ];
        assert!(!evaluate_conditions(&one_fails, &ctx));
    }
}
