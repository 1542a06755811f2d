//! # 进程内存储实现
//!
//! 所有状态保存在内存中，按数据类型分桶加锁。
//! 发布订阅为进程内扇出，订阅者队列有界，写满即丢弃。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Message, Store, Subscription};
use crate::error::{ProxyError, Result};

/// 每个订阅者的队列容量
const SUBSCRIBER_QUEUE_SIZE: usize = 64;

struct ValueEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

struct ChannelSubscriber {
    sender: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// 内存存储
pub struct MemoryStore {
    values: RwLock<HashMap<String, ValueEntry>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    lists: RwLock<HashMap<String, VecDeque<String>>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    subscribers: RwLock<HashMap<String, Vec<ChannelSubscriber>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut values = self.values.write().unwrap();
        values.insert(key.to_string(), ValueEntry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let values = self.values.read().unwrap();
        match values.get(key) {
            Some(entry) if !entry.is_expired() => Ok(entry.data.clone()),
            _ => Err(ProxyError::store_not_found(key)),
        }
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut values = self.values.write().unwrap();
        let occupied = values.get(key).is_some_and(|entry| !entry.is_expired());
        if occupied {
            return Ok(false);
        }
        values.insert(key.to_string(), ValueEntry::new(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().unwrap().remove(key);
        self.hashes.write().unwrap().remove(key);
        self.lists.write().unwrap().remove(key);
        self.sets.write().unwrap().remove(key);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let values = self.values.read().unwrap();
        Ok(values.get(key).is_some_and(|entry| !entry.is_expired()))
    }

    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let mut hashes = self.hashes.write().unwrap();
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field, value);
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<String> {
        let hashes = self.hashes.read().unwrap();
        hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned())
            .ok_or_else(|| ProxyError::store_not_found(key))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let hashes = self.hashes.read().unwrap();
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, incr: i64) -> Result<i64> {
        let mut hashes = self.hashes.write().unwrap();
        let hash = hashes.entry(key.to_string()).or_default();
        // 非数字字段按 0 处理
        let current = hash
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + incr;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        let mut lists = self.lists.write().unwrap();
        let list = lists.entry(key.to_string()).or_default();
        for value in values {
            list.push_front(value.clone());
        }
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<()> {
        let mut lists = self.lists.write().unwrap();
        if let Some(list) = lists.get_mut(key) {
            if count == 0 {
                list.retain(|item| item != value);
            } else {
                let mut remaining = count.unsigned_abs() as usize;
                let mut kept = VecDeque::with_capacity(list.len());
                while let Some(item) = list.pop_front() {
                    if remaining > 0 && item == value {
                        remaining -= 1;
                    } else {
                        kept.push_back(item);
                    }
                }
                *list = kept;
            }
        }
        Ok(())
    }

    async fn rotate(&self, key: &str) -> Result<String> {
        let mut lists = self.lists.write().unwrap();
        let Some(list) = lists.get_mut(key) else {
            return Err(ProxyError::store_not_found(key));
        };
        let Some(head) = list.pop_front() else {
            return Err(ProxyError::store_not_found(key));
        };
        list.push_back(head.clone());
        Ok(head)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        let mut sets = self.sets.write().unwrap();
        let set = sets.entry(key.to_string()).or_default();
        for member in members {
            set.insert(member.clone());
        }
        Ok(())
    }

    async fn spop_n(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut sets = self.sets.write().unwrap();
        let Some(set) = sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let picked: Vec<String> = set.iter().take(count).cloned().collect();
        for member in &picked {
            set.remove(member);
        }
        Ok(picked)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut subscribers = self.subscribers.write().unwrap();
        if let Some(channel_subs) = subscribers.get_mut(channel) {
            channel_subs
                .retain(|sub| !sub.cancel.is_cancelled() && !sub.sender.is_closed());
            for sub in channel_subs.iter() {
                let message = Message {
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                };
                // 队列写满时丢弃，订阅者靠下一次变更事件收敛
                let _ = sub.sender.try_send(message);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        let cancel = CancellationToken::new();

        let mut subscribers = self.subscribers.write().unwrap();
        subscribers
            .entry(channel.to_string())
            .or_default()
            .push(ChannelSubscriber {
                sender,
                cancel: cancel.clone(),
            });

        Ok(Subscription::new(receiver, cancel))
    }

    async fn clear(&self) -> Result<()> {
        self.values.write().unwrap().clear();
        self.hashes.write().unwrap().clear();
        self.lists.write().unwrap().clear();
        self.sets.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new();

        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v");

        let err = store.get("missing").await.unwrap_err();
        assert_eq!(err.error_code(), "STORE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_set_nx() {
        let store = MemoryStore::new();

        assert!(store.set_nx("k", b"first".to_vec(), None).await.unwrap());
        assert!(!store.set_nx("k", b"second".to_vec(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "active".to_string());
        fields.insert("failure_count".to_string(), "0".to_string());
        store.hset("key:1", fields).await.unwrap();

        assert_eq!(store.hget("key:1", "status").await.unwrap(), "active");
        assert_eq!(store.hget_all("key:1").await.unwrap().len(), 2);
        assert!(store.hget_all("missing").await.unwrap().is_empty());

        assert_eq!(store.hincr_by("key:1", "failure_count", 2).await.unwrap(), 2);
        assert_eq!(store.hincr_by("key:1", "failure_count", 3).await.unwrap(), 5);
        // 非数字字段按 0 起算
        assert_eq!(store.hincr_by("key:1", "status", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rotate_cycles_through_list() {
        let store = MemoryStore::new();
        store
            .lpush(
                "list",
                &["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await
            .unwrap();

        // lpush 依次前插，表头是最后压入的元素
        assert_eq!(store.rotate("list").await.unwrap(), "c");
        assert_eq!(store.rotate("list").await.unwrap(), "b");
        assert_eq!(store.rotate("list").await.unwrap(), "a");
        // 轮转一圈后回到起点
        assert_eq!(store.rotate("list").await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_rotate_fairness() {
        let store = MemoryStore::new();
        let members = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        store.lpush("list", &members).await.unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            let item = store.rotate("list").await.unwrap();
            *counts.entry(item).or_default() += 1;
        }
        // 10 次轮转 3 个元素：每个元素出现 ⌊10/3⌋ 或 ⌈10/3⌉ 次
        for count in counts.values() {
            assert!(*count == 3 || *count == 4);
        }
    }

    #[tokio::test]
    async fn test_rotate_empty_list() {
        let store = MemoryStore::new();
        let err = store.rotate("empty").await.unwrap_err();
        assert_eq!(err.error_code(), "STORE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_lrem_removes_all_occurrences() {
        let store = MemoryStore::new();
        store
            .lpush(
                "list",
                &[
                    "a".to_string(),
                    "b".to_string(),
                    "c".to_string(),
                    "b".to_string(),
                ],
            )
            .await
            .unwrap();

        store.lrem("list", 0, "b").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(store.rotate("list").await.unwrap());
        }
        assert!(!seen.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_set_operations() {
        let store = MemoryStore::new();
        store
            .sadd("set", &["m1".to_string(), "m2".to_string(), "m3".to_string()])
            .await
            .unwrap();

        let popped = store.spop_n("set", 2).await.unwrap();
        assert_eq!(popped.len(), 2);

        let rest = store.spop_n("set", 5).await.unwrap();
        assert_eq!(rest.len(), 1);

        assert!(store.spop_n("set", 1).await.unwrap().is_empty());
        assert!(store.spop_n("missing", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pubsub_delivery() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("events").await.unwrap();

        store.publish("events", b"hello").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, "events");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn test_pubsub_multiple_subscribers() {
        let store = MemoryStore::new();
        let mut sub1 = store.subscribe("events").await.unwrap();
        let mut sub2 = store.subscribe("events").await.unwrap();

        store.publish("events", b"fanout").await.unwrap();

        for sub in [&mut sub1, &mut sub2] {
            let msg = tokio::time::timeout(Duration::from_millis(100), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.payload, b"fanout");
        }
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        store.lpush("list", &["x".to_string()]).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.get("k").await.is_err());
        assert!(store.rotate("list").await.is_err());
    }
}
