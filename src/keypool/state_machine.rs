//! # 密钥状态机
//!
//! 纯函数：当前状态 × 成功与否 × 连续失败次数 → 新状态。
//! 配套的指数退避时长计算也在这里。

use chrono::Duration;

/// 连续失败多少次后进入禁用
pub const DISABLE_THRESHOLD: i64 = 3;

/// 退避时长上限（分钟）
const MAX_BACKOFF_MINUTES: i64 = 30;

/// 密钥状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStatus {
    /// 新增，待验证
    Pending,
    /// 活跃，正常使用
    Active,
    /// 降级，部分失败，但仍可使用
    Degraded,
    /// 禁用，连续失败，暂时禁用（指数退避）
    Disabled,
    /// 无效，永久无效，需要手动干预
    Invalid,
}

impl KeyStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Disabled => "disabled",
            Self::Invalid => "invalid",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "degraded" => Some(Self::Degraded),
            "disabled" => Some(Self::Disabled),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    /// 是否参与轮转选取
    ///
    /// 只有 active 和 degraded 进入轮转列表。
    #[must_use]
    pub const fn is_selectable(&self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// 全部有效状态
    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::Pending,
            Self::Active,
            Self::Degraded,
            Self::Disabled,
            Self::Invalid,
        ]
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行状态转换
///
/// `consecutive_failures` 是本次事件计入后的连续失败次数。
#[must_use]
pub fn transition(current: KeyStatus, is_success: bool, consecutive_failures: i64) -> KeyStatus {
    match current {
        KeyStatus::Pending => {
            if is_success {
                KeyStatus::Active
            } else if consecutive_failures >= DISABLE_THRESHOLD {
                KeyStatus::Disabled
            } else {
                KeyStatus::Pending
            }
        }
        KeyStatus::Active => {
            if is_success {
                KeyStatus::Active
            } else {
                KeyStatus::Degraded
            }
        }
        KeyStatus::Degraded => {
            if is_success {
                KeyStatus::Active
            } else if consecutive_failures >= DISABLE_THRESHOLD {
                KeyStatus::Disabled
            } else {
                KeyStatus::Degraded
            }
        }
        KeyStatus::Disabled => {
            if is_success {
                // 从禁用恢复先到降级，需要再次成功才回到活跃
                KeyStatus::Degraded
            } else {
                KeyStatus::Disabled
            }
        }
        // 无效状态只接受手动干预
        KeyStatus::Invalid => KeyStatus::Invalid,
    }
}

/// 计算指数退避时长
///
/// `min(30, 2^level)` 分钟，level ≤ 0 时取下限 1 分钟。
#[must_use]
pub fn backoff_duration(backoff_level: i32) -> Duration {
    if backoff_level <= 0 {
        return Duration::minutes(1);
    }
    let minutes = 2i64
        .checked_pow(backoff_level as u32)
        .unwrap_or(MAX_BACKOFF_MINUTES)
        .min(MAX_BACKOFF_MINUTES);
    Duration::minutes(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in KeyStatus::all() {
            assert_eq!(KeyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(KeyStatus::parse("unknown"), None);
    }

    #[test]
    fn test_selectable_states() {
        assert!(KeyStatus::Active.is_selectable());
        assert!(KeyStatus::Degraded.is_selectable());
        assert!(!KeyStatus::Pending.is_selectable());
        assert!(!KeyStatus::Disabled.is_selectable());
        assert!(!KeyStatus::Invalid.is_selectable());
    }

    #[test]
    fn test_pending_transitions() {
        assert_eq!(transition(KeyStatus::Pending, true, 0), KeyStatus::Active);
        assert_eq!(transition(KeyStatus::Pending, false, 1), KeyStatus::Pending);
        assert_eq!(transition(KeyStatus::Pending, false, 2), KeyStatus::Pending);
        assert_eq!(transition(KeyStatus::Pending, false, 3), KeyStatus::Disabled);
    }

    #[test]
    fn test_active_transitions() {
        assert_eq!(transition(KeyStatus::Active, true, 0), KeyStatus::Active);
        // 活跃状态失败先降级，无论失败次数
        assert_eq!(transition(KeyStatus::Active, false, 1), KeyStatus::Degraded);
        assert_eq!(transition(KeyStatus::Active, false, 99), KeyStatus::Degraded);
    }

    #[test]
    fn test_degraded_transitions() {
        assert_eq!(transition(KeyStatus::Degraded, true, 0), KeyStatus::Active);
        assert_eq!(
            transition(KeyStatus::Degraded, false, 2),
            KeyStatus::Degraded
        );
        assert_eq!(
            transition(KeyStatus::Degraded, false, 3),
            KeyStatus::Disabled
        );
    }

    #[test]
    fn test_disabled_recovers_to_degraded_not_active() {
        assert_eq!(transition(KeyStatus::Disabled, true, 0), KeyStatus::Degraded);
        assert_eq!(
            transition(KeyStatus::Disabled, false, 5),
            KeyStatus::Disabled
        );
    }

    #[test]
    fn test_invalid_is_absorbing() {
        assert_eq!(transition(KeyStatus::Invalid, true, 0), KeyStatus::Invalid);
        assert_eq!(transition(KeyStatus::Invalid, false, 10), KeyStatus::Invalid);
    }

    #[test]
    fn test_any_success_from_pending_reaches_active_in_one_step() {
        for failures in 0..10 {
            assert_eq!(
                transition(KeyStatus::Pending, true, failures),
                KeyStatus::Active
            );
        }
    }

    #[test]
    fn test_three_consecutive_failures_disable() {
        // 从 Pending 起连续失败
        let mut status = KeyStatus::Pending;
        for failures in 1..=3 {
            status = transition(status, false, failures);
        }
        assert_eq!(status, KeyStatus::Disabled);

        // 从 Active 起：第一次失败降级，再失败两次后禁用
        let mut status = KeyStatus::Active;
        for failures in 1..=3 {
            status = transition(status, false, failures);
        }
        assert_eq!(status, KeyStatus::Disabled);
    }

    #[test]
    fn test_backoff_duration() {
        assert_eq!(backoff_duration(0), Duration::minutes(1));
        assert_eq!(backoff_duration(-1), Duration::minutes(1));
        assert_eq!(backoff_duration(1), Duration::minutes(2));
        assert_eq!(backoff_duration(2), Duration::minutes(4));
        assert_eq!(backoff_duration(3), Duration::minutes(8));
        assert_eq!(backoff_duration(4), Duration::minutes(16));
        // 封顶 30 分钟
        assert_eq!(backoff_duration(5), Duration::minutes(30));
        assert_eq!(backoff_duration(20), Duration::minutes(30));
        // 大到溢出的 level 也停在上限
        assert_eq!(backoff_duration(i32::MAX), Duration::minutes(30));
    }
}
