//! 消息总线抽象与内存实现
//!
//! 投影器把 Outbox 行推往外部通道的出口。内存实现基于
//! `tokio::sync::broadcast`：
//! - `publish`：克隆并广播记录；
//! - `subscribe`：返回 `'static` 生命周期记录流，便于在 `tokio::spawn` 中使用；
//! - 典型用途：测试环境、示例与本地开发。
//!
//! 注意：无订阅者时发送将被忽略。

use crate::outbox::OutboxRecord;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use keel_domain::error::{DomainError, DomainResult};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// 消息总线接口：投影器只依赖 `publish`
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, record: &OutboxRecord) -> DomainResult<()>;

    /// 逐条顺序发送，任一失败即返回（保持分区内顺序）
    async fn publish_all(&self, records: &[OutboxRecord]) -> DomainResult<()> {
        for record in records {
            self.publish(record).await?;
        }
        Ok(())
    }
}

/// 简单的内存消息总线实现
#[derive(Clone)]
pub struct InMemoryMessageBus {
    tx: broadcast::Sender<OutboxRecord>,
}

impl InMemoryMessageBus {
    /// 创建一个内存总线，`capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 订阅后续发布的全部记录流
    pub fn subscribe(&self) -> BoxStream<'static, DomainResult<OutboxRecord>> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).map(|r| {
            r.map_err(|e| DomainError::MessageBus {
                reason: e.to_string(),
            })
        });
        Box::pin(stream)
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, record: &OutboxRecord) -> DomainResult<()> {
        // 无订阅者时 send 返回错误，视为非致命并忽略
        let _ = self.tx.send(record.clone());
        Ok(())
    }
}
