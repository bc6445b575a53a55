//! 幂等存储：按（租户，幂等键）缓存请求结果
//!
//! 写路径只有一次 upsert（完成即落终态），没有"处理中"占位状态，
//! 因此不存在占位残留需要对账的问题。重放判定：
//! - 键不存在 → 正常执行；
//! - 键存在且请求摘要一致且已完成 → 直接回放缓存响应；
//! - 键存在但请求摘要不一致 → 幂等键冲突（同键不同请求体）；
//! - 上次执行失败且摘要一致 → 允许重试执行。

use bon::Builder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_domain::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// 幂等键：租户内唯一
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub tenant_id: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(tenant_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Completed,
    Failed,
}

/// 一次已执行请求的登记
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct IdempotencyRecord {
    key: IdempotencyKey,
    operation: String,
    request_hash: String,
    response_body: Option<Value>,
    response_status: u16,
    status: IdempotencyStatus,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn request_hash(&self) -> &str {
        &self.request_hash
    }

    pub fn response_body(&self) -> Option<&Value> {
        self.response_body.as_ref()
    }

    pub fn response_status(&self) -> u16 {
        self.response_status
    }

    pub fn status(&self) -> IdempotencyStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// 重放判定结果
#[derive(Debug, Clone)]
pub enum ReplayDecision {
    /// 首次请求（或上次失败），正常执行
    Execute,
    /// 已成功执行过，回放缓存的响应
    Replay(IdempotencyRecord),
    /// 同一幂等键携带了不同的请求体
    Conflict,
}

impl ReplayDecision {
    /// 冲突按客户端错误上抛，其余两种转为可选的回放记录
    pub fn into_replay(self, key: &IdempotencyKey) -> DomainResult<Option<IdempotencyRecord>> {
        match self {
            ReplayDecision::Execute => Ok(None),
            ReplayDecision::Replay(record) => Ok(Some(record)),
            ReplayDecision::Conflict => Err(DomainError::IdempotencyConflict {
                key: key.key.clone(),
            }),
        }
    }
}

/// 请求体的规范化摘要：serde_json 序列化（对象键有序）后取 SHA-256
pub fn hash_request(body: &Value) -> String {
    let canonical = serde_json::to_string(body).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// 幂等存储接口
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get_response(&self, key: &IdempotencyKey) -> DomainResult<Option<IdempotencyRecord>>;

    /// 成功路径的唯一写：upsert 为 Completed
    async fn store_response(
        &self,
        key: IdempotencyKey,
        operation: &str,
        request_hash: &str,
        response_body: Option<Value>,
        response_status: u16,
        ttl: Option<Duration>,
    ) -> DomainResult<()>;

    /// 登记失败，允许同摘要重试
    async fn mark_failed(&self, key: &IdempotencyKey) -> DomainResult<()>;

    /// 执行前判定：执行、回放或冲突
    async fn check(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
    ) -> DomainResult<ReplayDecision> {
        let Some(record) = self.get_response(key).await? else {
            return Ok(ReplayDecision::Execute);
        };
        if record.request_hash() != request_hash {
            return Ok(ReplayDecision::Conflict);
        }
        match record.status() {
            IdempotencyStatus::Completed => Ok(ReplayDecision::Replay(record)),
            IdempotencyStatus::Failed => Ok(ReplayDecision::Execute),
        }
    }
}

/// 内存幂等存储：读取时惰性剔除过期条目
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<IdempotencyKey, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get_response(&self, key: &IdempotencyKey) -> DomainResult<Option<IdempotencyRecord>> {
        if let Some(record) = self.records.get(key) {
            if record.is_expired() {
                drop(record);
                self.records.remove(key);
                return Ok(None);
            }
            return Ok(Some(record.clone()));
        }
        Ok(None)
    }

    async fn store_response(
        &self,
        key: IdempotencyKey,
        operation: &str,
        request_hash: &str,
        response_body: Option<Value>,
        response_status: u16,
        ttl: Option<Duration>,
    ) -> DomainResult<()> {
        let expires_at = ttl
            .map(|d| {
                chrono::Duration::from_std(d).map_err(|e| DomainError::Validation {
                    reason: format!("幂等 TTL 超出范围: {e}"),
                })
            })
            .transpose()?
            .map(|d| Utc::now() + d);

        let record = IdempotencyRecord::builder()
            .key(key.clone())
            .operation(operation.into())
            .request_hash(request_hash.into())
            .maybe_response_body(response_body)
            .response_status(response_status)
            .status(IdempotencyStatus::Completed)
            .maybe_expires_at(expires_at)
            .build();
        self.records.insert(key, record);
        Ok(())
    }

    async fn mark_failed(&self, key: &IdempotencyKey) -> DomainResult<()> {
        if let Some(mut record) = self.records.get_mut(key) {
            record.status = IdempotencyStatus::Failed;
        }
        Ok(())
    }
}
