//! # 密钥策略处理器
//!
//! 失败信号先过策略引擎，命中的动作分发到状态服务；
//! 任何分支的错误都只记日志，绝不影响用户请求。

use std::sync::Arc;

use super::provider::SelectedKey;
use super::state_service::KeyStateService;
use crate::keypool::GroupInfo;
use crate::logging::{LogComponent, LogStage};
use crate::policy::{
    PolicyAction, PolicyEngine, PolicyEvaluationContext, PolicyEvaluationResult, parse_duration,
};
use crate::{lerror, linfo};

/// 降级策略未给出时长时的默认禁用时长
const DEFAULT_DEGRADATION_MINUTES: i64 = 30;

/// 密钥策略处理器
pub struct KeyPolicyHandler {
    policy_engine: Arc<PolicyEngine>,
    state_service: Arc<KeyStateService>,
}

impl KeyPolicyHandler {
    #[must_use]
    pub fn new(policy_engine: Arc<PolicyEngine>, state_service: Arc<KeyStateService>) -> Self {
        Self {
            policy_engine,
            state_service,
        }
    }

    /// 处理密钥成功
    pub async fn handle_key_success(&self, key_id: i64) {
        if let Err(err) = self.state_service.handle_success(key_id).await {
            lerror!(
                "system",
                LogStage::Scheduling,
                LogComponent::PolicyHandler,
                "key_success_failed",
                "Failed to handle key success",
                key_id = key_id,
                error = %err
            );
        }
    }

    /// 处理密钥失败
    ///
    /// 评估重试策略：`invalidate` 和 `disable` 走手动覆写路径，
    /// 其余（retry / degrade / 未命中）走默认状态机路径。
    pub async fn handle_key_failure(&self, key: &SelectedKey, group: &GroupInfo, error_message: &str) {
        let context = PolicyEvaluationContext {
            group_id: group.model.id,
            key_id: key.id,
            model: String::new(),
            status_code: 0,
            error_message: error_message.to_string(),
            error_type: String::new(),
            failure_count: key.failure_count,
            request_count: key.request_count,
        };

        let retry_result = match self
            .policy_engine
            .evaluate_retry_policies(group.model.id, &context)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                lerror!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::PolicyHandler,
                    "retry_policy_eval_failed",
                    "Failed to evaluate retry policies",
                    key_id = key.id,
                    error = %err
                );
                None
            }
        };

        if let Some(result) = retry_result.filter(|r| r.matched) {
            linfo!(
                "system",
                LogStage::Scheduling,
                LogComponent::PolicyHandler,
                "policy_failure_handling",
                "Policy-based failure handling",
                key_id = key.id,
                policy = %result.policy_name,
                rule = %result.rule_name,
                action = %result.action,
                reason = %result.reason
            );

            match PolicyAction::parse(&result.action) {
                Some(PolicyAction::Invalidate) => {
                    if let Err(err) = self
                        .state_service
                        .manually_invalidate_key(key.id, &result.reason)
                        .await
                    {
                        lerror!(
                            "system",
                            LogStage::Scheduling,
                            LogComponent::PolicyHandler,
                            "policy_invalidate_failed",
                            "Failed to invalidate key based on policy",
                            key_id = key.id,
                            error = %err
                        );
                    }
                }
                Some(PolicyAction::Disable) => {
                    if let Err(err) = self
                        .state_service
                        .manually_disable_key(key.id, &result.reason)
                        .await
                    {
                        lerror!(
                            "system",
                            LogStage::Scheduling,
                            LogComponent::PolicyHandler,
                            "policy_disable_failed",
                            "Failed to disable key based on policy",
                            key_id = key.id,
                            error = %err
                        );
                    }
                }
                // retry / degrade / 未识别动作走默认失败路径
                _ => self.default_failure(key.id, error_message).await,
            }
            return;
        }

        // 重试策略未命中时评估降级策略
        let degradation_result = match self
            .policy_engine
            .evaluate_degradation_policies(group.model.id, &context)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                lerror!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::PolicyHandler,
                    "degradation_policy_eval_failed",
                    "Failed to evaluate degradation policies",
                    key_id = key.id,
                    error = %err
                );
                None
            }
        };

        if let Some(result) = degradation_result.filter(|r| r.matched) {
            self.apply_degradation(key.id, &result).await;
        } else {
            self.default_failure(key.id, error_message).await;
        }
    }

    /// 执行降级策略命中的动作
    async fn apply_degradation(&self, key_id: i64, result: &PolicyEvaluationResult) {
        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::PolicyHandler,
            "degradation_policy_handling",
            "Degradation policy matched",
            key_id = key_id,
            policy = %result.policy_name,
            rule = %result.rule_name,
            action = %result.action,
            duration = %result.duration
        );

        let outcome = match PolicyAction::parse(&result.action) {
            Some(PolicyAction::Invalidate) => {
                self.state_service
                    .manually_invalidate_key(key_id, &result.reason)
                    .await
            }
            _ => {
                let duration = parse_duration(&result.duration).unwrap_or_else(|| {
                    chrono::Duration::minutes(DEFAULT_DEGRADATION_MINUTES)
                });
                self.state_service
                    .manually_disable_key_for(key_id, &result.reason, duration)
                    .await
            }
        };

        if let Err(err) = outcome {
            lerror!(
                "system",
                LogStage::Scheduling,
                LogComponent::PolicyHandler,
                "degradation_apply_failed",
                "Failed to apply degradation policy action",
                key_id = key_id,
                error = %err
            );
        }
    }

    async fn default_failure(&self, key_id: i64, error_message: &str) {
        if let Err(err) = self.state_service.handle_failure(key_id, error_message).await {
            lerror!(
                "system",
                LogStage::Scheduling,
                LogComponent::PolicyHandler,
                "key_failure_failed",
                "Failed to handle key failure",
                key_id = key_id,
                error = %err
            );
        }
    }
}
