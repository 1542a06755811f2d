//! # 存储工厂
//!
//! 根据 `REDIS_DSN` 选择进程内实现或 Redis 实现

use std::sync::Arc;

use super::{MemoryStore, RedisStore, Store};
use crate::error::Result;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 构建共享存储
///
/// `redis_dsn` 为空时使用进程内存储，适合单进程部署；
/// 多副本部署必须配置 Redis。
pub async fn build_store(redis_dsn: &str) -> Result<Arc<dyn Store>> {
    if redis_dsn.is_empty() {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Store,
            "store_init",
            "Using in-process memory store"
        );
        return Ok(Arc::new(MemoryStore::new()));
    }

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Store,
        "store_init",
        "Using Redis store",
        dsn_configured = true
    );
    let store = RedisStore::new(redis_dsn).await?;
    Ok(Arc::new(store))
}
