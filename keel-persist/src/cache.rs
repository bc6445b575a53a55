//! 缓存抽象与内存实现
//!
//! 缓存拦截器依赖的最小接口：读、带 TTL 写、单键删除与前缀批量失效。
//! 生产环境可接 Redis 等实现，内存实现基于 DashMap，供测试与单机场景。

use dashmap::DashMap;
use keel_domain::error::DomainResult;
use serde_json::Value;
use std::time::{Duration, Instant};

/// 缓存接口
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> DomainResult<Option<Value>>;

    /// ttl 为 None 表示不过期
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> DomainResult<()>;

    async fn delete(&self, key: &str) -> DomainResult<()>;

    /// 删除指定前缀的全部键，返回删除数量
    async fn delete_pattern(&self, prefix: &str) -> DomainResult<u64>;
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// 内存缓存：读取时惰性剔除过期条目
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> DomainResult<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> DomainResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> DomainResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, prefix: &str) -> DomainResult<u64> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
