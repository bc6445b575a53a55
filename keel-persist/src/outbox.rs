//! 事务性出站事件台账（Outbox）
//!
//! Outbox 行在拥有事务内随聚合写入一并落库（由工作单元完成），
//! 此后仅由投递器（Projector）推进其状态：
//! `New → Publishing → {Sent | New(重试)} → Dead`（连续失败达上限）。
//!
//! `pull_batch` 必须以"条件更新并返回"的原子领取语义实现
//! （等价于 `UPDATE ... WHERE status = 'NEW' ... RETURNING`），
//! 先查后改在多投递器实例并发时会重复领取同一行，属设计禁区。
//!
use crate::storage::InMemoryDatabase;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use keel_domain::error::DomainResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Outbox 行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    New,
    Publishing,
    Sent,
    Dead,
}

/// Outbox 行：一条待发布的出站事件
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// 行唯一标识
    #[builder(default = Uuid::new_v4().to_string())]
    id: String,
    /// 全局位点，由存储层在落库时赋值；决定投递顺序
    sequence: Option<i64>,
    /// 发布目标主题
    topic: String,
    /// 事件所属聚合类型
    aggregate_type: String,
    /// 事件所属聚合实例
    aggregate_id: String,
    /// 事件落库时的聚合版本
    aggregate_version: usize,
    /// 事件载荷（序列化形态）
    payload: Value,
    /// 可选标头（如租户、链路信息）
    headers: Option<Value>,
    #[builder(default = OutboxStatus::New)]
    status: OutboxStatus,
    /// 仅在发布失败时递增
    #[builder(default)]
    retry_count: u32,
    /// 最近一次失败原因
    last_error: Option<String>,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
    /// 最近一次被领取的时间；在途回收据此判定滞留
    claimed_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn record_id(&self) -> &str {
        &self.id
    }

    pub fn sequence(&self) -> Option<i64> {
        self.sequence
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn aggregate_version(&self) -> usize {
        self.aggregate_version
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn headers(&self) -> Option<&Value> {
        self.headers.as_ref()
    }

    /// 标头中的租户标识（若有）
    pub fn tenant_id(&self) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get("tenant_id"))
            .and_then(|v| v.as_str())
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub(crate) fn set_sequence(&mut self, sequence: i64) {
        self.sequence = Some(sequence);
    }

    pub(crate) fn mark_claimed(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Publishing;
        self.claimed_at = Some(at);
    }

    /// 在途回收：放回待发，不计一次重试
    pub(crate) fn requeue(&mut self) {
        self.status = OutboxStatus::New;
        self.claimed_at = None;
    }

    pub(crate) fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.published_at = Some(at);
    }

    /// 失败回退：递增重试计数，未达上限回到 New，达上限转 Dead。
    /// 返回回退后的状态。
    pub(crate) fn mark_retry(&mut self, reason: &str, max_attempts: u32) -> OutboxStatus {
        self.retry_count += 1;
        self.last_error = Some(reason.to_string());
        self.claimed_at = None;
        self.status = if self.retry_count >= max_attempts {
            OutboxStatus::Dead
        } else {
            OutboxStatus::New
        };
        self.status
    }
}

/// Outbox 存储协议
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 直接追加一行（非聚合事件；聚合事件由工作单元在事务内写入）
    async fn add(&self, record: OutboxRecord) -> DomainResult<()>;

    /// 原子领取至多 `limit` 行 New 状态的记录并翻转为 Publishing。
    /// 并发投递器实例之间同一行至多被领取一次。
    async fn pull_batch(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> DomainResult<Vec<OutboxRecord>>;

    /// 标记发布成功（Sent），记录发布时间
    async fn mark_published(&self, id: &str) -> DomainResult<()>;

    /// 标记发布失败：递增重试，回到 New 或转入终态 Dead。
    /// Sent/Dead 行的失败标记是幂等空操作。返回回退后的状态。
    async fn mark_failed(&self, id: &str, reason: &str) -> DomainResult<OutboxStatus>;

    /// 将领取时间早于 `claimed_before` 且仍处 Publishing 的行放回 New。
    /// 覆盖投递实例在领取与标记之间崩溃的在途滞留。返回放回的行数。
    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> DomainResult<usize>;

    /// 按状态列出（运维排查：如 Dead 行告警）
    async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> DomainResult<Vec<OutboxRecord>>;
}

/// 默认最大投递尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// 基于共享内存数据库的 Outbox 存储。
/// 领取与状态翻转在数据库的单一锁下完成，天然满足原子领取语义。
pub struct InMemoryOutboxStore {
    db: InMemoryDatabase,
    max_attempts: u32,
}

impl InMemoryOutboxStore {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self::with_max_attempts(db, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(db: InMemoryDatabase, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, record: OutboxRecord) -> DomainResult<()> {
        self.db.outbox_append(vec![record]);
        Ok(())
    }

    async fn pull_batch(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> DomainResult<Vec<OutboxRecord>> {
        Ok(self.db.outbox_claim(limit, tenant_id))
    }

    async fn mark_published(&self, id: &str) -> DomainResult<()> {
        self.db.outbox_mark_published(id)
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> DomainResult<OutboxStatus> {
        let status = self.db.outbox_mark_failed(id, reason, self.max_attempts)?;
        if status == OutboxStatus::Dead {
            tracing::error!(record_id = id, reason, "outbox record dead-lettered");
        }
        Ok(status)
    }

    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> DomainResult<usize> {
        Ok(self.db.outbox_requeue_stale(claimed_before))
    }

    async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> DomainResult<Vec<OutboxRecord>> {
        Ok(self.db.outbox_find_by_status(status, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(topic: &str) -> OutboxRecord {
        OutboxRecord::builder()
            .topic(topic.to_string())
            .aggregate_type("order".to_string())
            .aggregate_id("o-1".to_string())
            .aggregate_version(1)
            .payload(json!({"topic": topic}))
            .build()
    }

    fn tenant_record(topic: &str, tenant: &str) -> OutboxRecord {
        OutboxRecord::builder()
            .topic(topic.to_string())
            .aggregate_type("order".to_string())
            .aggregate_id("o-1".to_string())
            .aggregate_version(1)
            .payload(json!({}))
            .headers(json!({"tenant_id": tenant}))
            .build()
    }

    #[tokio::test]
    async fn pull_batch_claims_each_row_exactly_once() {
        let store = InMemoryOutboxStore::new(InMemoryDatabase::new());
        store.add(record("a")).await.unwrap();
        store.add(record("b")).await.unwrap();
        store.add(record("c")).await.unwrap();

        let first = store.pull_batch(2, None).await.unwrap();
        let second = store.pull_batch(10, None).await.unwrap();
        let third = store.pull_batch(10, None).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert!(first.iter().chain(&second).all(|r| r.status() == OutboxStatus::Publishing));
        // 领取顺序与落库顺序一致
        assert_eq!(first[0].topic(), "a");
        assert_eq!(first[1].topic(), "b");
        assert_eq!(second[0].topic(), "c");
    }

    #[tokio::test]
    async fn pull_batch_filters_by_tenant() {
        let store = InMemoryOutboxStore::new(InMemoryDatabase::new());
        store.add(tenant_record("a", "t-1")).await.unwrap();
        store.add(tenant_record("b", "t-2")).await.unwrap();

        let claimed = store.pull_batch(10, Some("t-2")).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].topic(), "b");
    }

    #[tokio::test]
    async fn mark_failed_transitions_to_dead_after_max_attempts() {
        let store = InMemoryOutboxStore::with_max_attempts(InMemoryDatabase::new(), 3);
        store.add(record("a")).await.unwrap();
        let id = store.pull_batch(1, None).await.unwrap()[0]
            .record_id()
            .to_string();

        assert_eq!(
            store.mark_failed(&id, "broker down").await.unwrap(),
            OutboxStatus::New
        );
        store.pull_batch(1, None).await.unwrap();
        assert_eq!(
            store.mark_failed(&id, "broker down").await.unwrap(),
            OutboxStatus::New
        );
        store.pull_batch(1, None).await.unwrap();
        assert_eq!(
            store.mark_failed(&id, "broker down").await.unwrap(),
            OutboxStatus::Dead
        );

        // 终态：不再被领取，继续失败标记为空操作
        assert!(store.pull_batch(10, None).await.unwrap().is_empty());
        assert_eq!(
            store.mark_failed(&id, "again").await.unwrap(),
            OutboxStatus::Dead
        );
        let dead = store.find_by_status(OutboxStatus::Dead, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count(), 3);
    }

    #[tokio::test]
    async fn stale_publishing_rows_are_requeued() {
        let store = InMemoryOutboxStore::new(InMemoryDatabase::new());
        store.add(record("a")).await.unwrap();
        store.add(record("b")).await.unwrap();

        let claimed = store.pull_batch(1, None).await.unwrap();
        assert_eq!(claimed[0].topic(), "a");

        // 时限未到：不回收
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(store.requeue_stale(past).await.unwrap(), 0);

        // 时限已过：放回待发并可再次领取，不计一次重试
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.requeue_stale(cutoff).await.unwrap(), 1);
        let retried = store.pull_batch(10, None).await.unwrap();
        assert_eq!(retried.len(), 2);
        assert_eq!(retried[0].topic(), "a");
        assert_eq!(retried[0].retry_count(), 0);
    }

    #[tokio::test]
    async fn requeue_skips_terminal_rows() {
        let store = InMemoryOutboxStore::new(InMemoryDatabase::new());
        store.add(record("a")).await.unwrap();
        let id = store.pull_batch(1, None).await.unwrap()[0]
            .record_id()
            .to_string();
        store.mark_published(&id).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.requeue_stale(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_published_sets_sent_and_timestamp() {
        let store = InMemoryOutboxStore::new(InMemoryDatabase::new());
        store.add(record("a")).await.unwrap();
        let id = store.pull_batch(1, None).await.unwrap()[0]
            .record_id()
            .to_string();

        store.mark_published(&id).await.unwrap();
        let sent = store.find_by_status(OutboxStatus::Sent, 10).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].published_at().is_some());
    }
}
