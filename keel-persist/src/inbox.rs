//! 收件箱（Inbox）：消费侧按消息 ID 去重
//!
//! 消费者处理消息前先落收件箱，主键冲突即判定重复投递。
//! 记录只增不改，由定期清理按时间裁剪。

use bon::Builder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use keel_domain::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一条已处理消息的登记
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct InboxRecord {
    message_id: String,
    tenant_id: Option<String>,
    event_type: String,
    /// 消息体摘要（排查载荷不一致的重复投递）
    payload_hash: Option<String>,
    #[builder(default = Utc::now())]
    processed_at: DateTime<Utc>,
    extra: Option<Value>,
}

impl InboxRecord {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload_hash(&self) -> Option<&str> {
        self.payload_hash.as_deref()
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }

    pub fn extra(&self) -> Option<&Value> {
        self.extra.as_ref()
    }
}

/// 收件箱接口
#[async_trait::async_trait]
pub trait InboxStore: Send + Sync {
    async fn is_processed(&self, message_id: &str) -> DomainResult<bool>;

    /// 登记消息；重复 ID 返回 `DuplicateMessage`
    async fn mark_processed(&self, record: InboxRecord) -> DomainResult<()>;

    /// 删除处理时间早于 `older_than` 的记录，返回删除数量
    async fn cleanup_old_records(&self, older_than: DateTime<Utc>) -> DomainResult<usize>;
}

/// 内存收件箱：DashMap 的 entry 语义保证"检查并登记"原子
#[derive(Default)]
pub struct InMemoryInboxStore {
    records: DashMap<String, InboxRecord>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn is_processed(&self, message_id: &str) -> DomainResult<bool> {
        Ok(self.records.contains_key(message_id))
    }

    async fn mark_processed(&self, record: InboxRecord) -> DomainResult<()> {
        match self.records.entry(record.message_id.clone()) {
            Entry::Occupied(_) => Err(DomainError::DuplicateMessage {
                message_id: record.message_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn cleanup_old_records(&self, older_than: DateTime<Utc>) -> DomainResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, r| r.processed_at >= older_than);
        Ok(before - self.records.len())
    }
}
