//! 领域事件（Domain Event）
//!
//! 定义出站事件载荷需要实现的最小接口。事件由聚合在状态变更时缓冲，
//! 在工作单元提交时作为 Outbox 行与聚合写入同事务落库。
//!
use serde::Serialize;
use std::fmt;

/// 领域事件载荷需要满足的通用能力边界
pub trait DomainEvent: Clone + fmt::Debug + Serialize + Send + Sync {
    /// 事件类型（形如 `OrderEvent.Created` 或自定义类型名）
    fn event_type(&self) -> &str;

    /// 发布目标主题；默认与事件类型同名
    fn topic(&self) -> String {
        self.event_type().to_string()
    }
}
