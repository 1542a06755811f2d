//! # Redis 存储实现
//!
//! 包装远端 Redis 服务，多副本共享状态时必须使用此实现。
//! 命令走连接管理器，发布订阅由后台任务转发到有界队列。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Message, Store, Subscription};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 每个订阅者的队列容量
const SUBSCRIBER_QUEUE_SIZE: usize = 64;

/// Redis 存储
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// 连接 Redis 并建立连接管理器
    pub async fn new(dsn: &str) -> Result<Self> {
        let client = redis::Client::open(dsn)
            .map_err(|e| ProxyError::store_with_source("创建Redis客户端失败", e))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| ProxyError::store_with_source("建立Redis连接失败", e))?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        value.ok_or_else(|| ProxyError::store_not_found(key))
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<String> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        value.ok_or_else(|| ProxyError::store_not_found(key))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(map)
    }

    async fn hincr_by(&self, key: &str, field: &str, incr: i64) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(incr)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key);
        for value in values {
            cmd.arg(value);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn rotate(&self, key: &str) -> Result<String> {
        // LMOVE 同源同目标即为原子轮转
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("LMOVE")
            .arg(key)
            .arg(key)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await?;
        value.ok_or_else(|| ProxyError::store_not_found(key))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key);
        for member in members {
            cmd.arg(member);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn spop_n(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SPOP")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ProxyError::store_with_source("建立Redis订阅连接失败", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| ProxyError::store_with_source("订阅Redis频道失败", e))?;

        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let channel_name = channel.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    maybe_msg = stream.next() => {
                        let Some(msg) = maybe_msg else { break };
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                lwarn!(
                                    "system",
                                    LogStage::Store,
                                    LogComponent::Store,
                                    "pubsub_payload_decode_failed",
                                    "Failed to decode pub/sub payload, skipping message",
                                    error = %err
                                );
                                continue;
                            }
                        };
                        let message = Message {
                            channel: msg.get_channel_name().to_string(),
                            payload,
                        };
                        // 队列写满时丢弃，订阅者靠下一次变更事件收敛
                        if sender.try_send(message).is_err() && sender.is_closed() {
                            break;
                        }
                    }
                }
            }
            ldebug!(
                "system",
                LogStage::Store,
                LogComponent::Store,
                "pubsub_forwarder_exit",
                "Redis pub/sub forwarder stopped",
                channel = %channel_name
            );
        });

        Ok(Subscription::new(receiver, cancel))
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
