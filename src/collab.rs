//! 协作方接口：权限规则与缓存/限流状态
//!
//! EventBus 只消费这些接口，不拥有其实现。生产部署由外部存储支撑，
//! 这里附带的内存实现用于测试与单进程场景。

use crate::identity::ChatIdentity;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// 权限规则提供方
///
/// 返回发送者满足的规则标识集合 (形如 `plugin/scope`)。
/// 返回 None 表示对该发送者不做规则校验。
#[async_trait]
pub trait RoleProvider: Send + Sync {
    async fn user_rules(&self, sender: &ChatIdentity) -> Option<HashSet<String>>;
}

/// 放行一切的提供方，默认接入
pub struct AllowAllRoles;

#[async_trait]
impl RoleProvider for AllowAllRoles {
    async fn user_rules(&self, _sender: &ChatIdentity) -> Option<HashSet<String>> {
        None
    }
}

/// 静态规则表，按 user_id 查询
#[derive(Default)]
pub struct StaticRoleProvider {
    rules: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticRoleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rules(&self, user_id: impl Into<String>, rules: impl IntoIterator<Item = String>) {
        self.rules
            .write()
            .unwrap()
            .insert(user_id.into(), rules.into_iter().collect());
    }
}

#[async_trait]
impl RoleProvider for StaticRoleProvider {
    async fn user_rules(&self, sender: &ChatIdentity) -> Option<HashSet<String>> {
        let user_id = sender.user_id.as_deref()?;
        self.rules.read().unwrap().get(user_id).cloned()
    }
}

/// 缓存存储，插件用它实现限流等状态
///
/// EventBus 本身不做限流，只把插件抛出的 `RateLimited` 错误转成用户提示。
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
    /// 自增计数器，常用于窗口限流；返回自增后的值
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> i64;
    async fn remove(&self, key: &str);
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// 进程内缓存实现
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(key)?;
        if entry.expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries.write().unwrap().insert(key.to_string(), entry);
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> i64 {
        let mut entries = self.entries.write().unwrap();
        let current = entries
            .get(key)
            .filter(|e| !e.expired())
            .and_then(|e| e.value.as_i64())
            .unwrap_or(0);
        let next = current + 1;
        // 续用已有的过期时间，新键才应用 ttl
        let expires_at = match entries.get(key).filter(|e| !e.expired()) {
            Some(e) => e.expires_at,
            None => ttl.map(|d| Instant::now() + d),
        };
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: Value::from(next),
                expires_at,
            },
        );
        next
    }

    async fn remove(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChatIdentity;

    #[tokio::test]
    async fn static_rules_lookup() {
        let provider = StaticRoleProvider::new();
        provider.set_rules("u1", vec!["echo/main".to_string()]);

        let sender = ChatIdentity::private("qq", "r1", "u1");
        let rules = provider.user_rules(&sender).await.unwrap();
        assert!(rules.contains("echo/main"));

        let stranger = ChatIdentity::private("qq", "r1", "u2");
        assert!(provider.user_rules(&stranger).await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_ttl_and_incr() {
        let cache = MemoryCache::new();
        cache.set("k", Value::from("v"), None).await;
        assert_eq!(cache.get("k").await, Some(Value::from("v")));

        cache
            .set("gone", Value::from(1), Some(Duration::from_millis(0)))
            .await;
        assert_eq!(cache.get("gone").await, None);

        assert_eq!(cache.incr("count", None).await, 1);
        assert_eq!(cache.incr("count", None).await, 2);

        cache.remove("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
