//! # 共享存储键布局
//!
//! 密钥详情哈希和分组轮转列表的键名约定

/// 单个密钥的详情哈希键
#[must_use]
pub fn key_detail_key(key_id: i64) -> String {
    format!("key:{key_id}")
}

/// 分组的轮转列表键，仅包含 active / degraded 密钥的 id
#[must_use]
pub fn active_keys_key(group_id: i32) -> String {
    format!("group:{group_id}:active_keys")
}

/// 按状态维护某个密钥在轮转列表与详情哈希中的成员关系
///
/// 后台路径使用：存储故障只记日志，不向调用方传播。
pub(crate) async fn sync_membership(
    store: &dyn crate::store::Store,
    group_id: i32,
    key_id: i64,
    status: super::state_machine::KeyStatus,
) {
    use crate::logging::{LogComponent, LogStage};
    use crate::lwarn;

    let detail_key = key_detail_key(key_id);
    let list_key = active_keys_key(group_id);
    let id_str = key_id.to_string();

    let mut fields = std::collections::HashMap::new();
    fields.insert("status".to_string(), status.as_str().to_string());
    if let Err(err) = store.hset(&detail_key, fields).await {
        lwarn!(
            "system",
            LogStage::Store,
            LogComponent::KeyPool,
            "membership_sync_failed",
            "Failed to sync key status to store",
            key_id = key_id,
            error = %err
        );
        return;
    }

    let _ = store.lrem(&list_key, 0, &id_str).await;
    if status.is_selectable() {
        if let Err(err) = store.lpush(&list_key, &[id_str]).await {
            lwarn!(
                "system",
                LogStage::Store,
                LogComponent::KeyPool,
                "membership_push_failed",
                "Failed to add key to rotation list",
                key_id = key_id,
                error = %err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(key_detail_key(123), "key:123");
        assert_eq!(active_keys_key(7), "group:7:active_keys");
    }
}
