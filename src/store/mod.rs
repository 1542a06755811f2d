//! # 共享存储抽象层
//!
//! 提供统一的 KV / 哈希 / 列表 / 集合 / 发布订阅接口，
//! 支持进程内实现和 Redis 实现。控制面依赖此抽象在
//! 单进程与多副本部署之间切换。

mod factory;
mod memory;
mod redis_store;

pub use factory::build_store;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// 发布订阅消息
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// 订阅句柄
///
/// 内部是一个有界接收队列；发布侧写满时丢弃消息，
/// 订阅者依赖后续变更事件重新收敛。
pub struct Subscription {
    receiver: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(receiver: mpsc::Receiver<Message>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// 接收下一条消息，订阅关闭后返回 `None`
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// 关闭订阅
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 统一存储接口
///
/// 契约要点：
/// - `get` 未命中返回 `StoreNotFound`
/// - `rotate` 原子地弹出表头并追加到表尾，空表返回 `StoreNotFound`
/// - `set_nx` 返回写入是否发生
#[async_trait]
pub trait Store: Send + Sync {
    /// 写入字节值，`ttl` 为 `None` 时永不过期
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// 读取字节值
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// 不存在时写入，返回写入是否发生
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// 删除单个键，键不存在不算错误
    async fn delete(&self, key: &str) -> Result<()>;

    /// 批量删除
    async fn del(&self, keys: &[String]) -> Result<()>;

    /// 键是否存在
    async fn exists(&self, key: &str) -> Result<bool>;

    /// 写入哈希字段
    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> Result<()>;

    /// 读取单个哈希字段
    async fn hget(&self, key: &str, field: &str) -> Result<String>;

    /// 读取整个哈希，键不存在返回空表
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// 哈希字段自增
    async fn hincr_by(&self, key: &str, field: &str, incr: i64) -> Result<i64>;

    /// 从表头批量插入
    async fn lpush(&self, key: &str, values: &[String]) -> Result<()>;

    /// 删除列表中的匹配元素，`count` 为 0 时删除全部
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<()>;

    /// 轮转：原子弹出表头并追加到表尾，返回弹出的元素
    async fn rotate(&self, key: &str) -> Result<String>;

    /// 向集合添加成员
    async fn sadd(&self, key: &str, members: &[String]) -> Result<()>;

    /// 从集合弹出至多 `count` 个成员
    async fn spop_n(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// 发布消息
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// 订阅频道
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// 清空全部数据
    async fn clear(&self) -> Result<()>;
}
