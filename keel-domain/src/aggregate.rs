//! 聚合（Aggregate）抽象
//!
//! 约束一个聚合的核心行为：
//! - 状态即持久化单元，通过 `Entity` 约束标识与版本；
//! - 状态变更时以 `record_event` 缓冲领域事件（不落库）；
//! - 工作单元提交时 `drain_events` 取走缓冲事件并写入 Outbox，
//!   失败回滚则缓冲事件随之丢弃，保证"无双写"。
//!
use crate::domain_event::DomainEvent;
use crate::entity::Entity;
use serde::{Serialize, de::DeserializeOwned};

/// 聚合根接口
pub trait Aggregate: Entity + Default + Serialize + DeserializeOwned + Send + Sync {
    const TYPE: &'static str;

    /// 该聚合产生的领域事件类型
    type Event: DomainEvent;

    /// 缓冲一个领域事件（由聚合的状态变更方法调用）
    fn record_event(&mut self, event: Self::Event);

    /// 查看已缓冲、尚未提交的事件
    fn pending_events(&self) -> &[Self::Event];

    /// 取走并清空缓冲事件
    fn drain_events(&mut self) -> Vec<Self::Event>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_object::Version;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        id: String,
        version: Version,
        value: i32,
        #[serde(skip)]
        events: Vec<CounterEvent>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum CounterEvent {
        Added { amount: i32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &str {
            match self {
                CounterEvent::Added { .. } => "CounterEvent.Added",
            }
        }
    }

    impl Entity for Counter {
        type Id = String;
        fn new(id: Self::Id) -> Self {
            Self {
                id,
                ..Default::default()
            }
        }
        fn id(&self) -> &Self::Id {
            &self.id
        }
        fn version(&self) -> Version {
            self.version
        }
        fn set_version(&mut self, version: Version) {
            self.version = version;
        }
    }

    impl Aggregate for Counter {
        const TYPE: &'static str = "counter";
        type Event = CounterEvent;

        fn record_event(&mut self, event: Self::Event) {
            self.events.push(event);
        }
        fn pending_events(&self) -> &[Self::Event] {
            &self.events
        }
        fn drain_events(&mut self) -> Vec<Self::Event> {
            std::mem::take(&mut self.events)
        }
    }

    impl Counter {
        fn add(&mut self, amount: i32) {
            self.value += amount;
            self.record_event(CounterEvent::Added { amount });
        }
    }

    #[test]
    fn events_are_buffered_in_raise_order_and_drained_once() {
        let mut c = Counter::new("c-1".to_string());
        c.add(3);
        c.add(2);

        assert_eq!(c.pending_events().len(), 2);
        assert_eq!(c.value, 5);

        let drained = c.drain_events();
        assert_eq!(
            drained,
            vec![
                CounterEvent::Added { amount: 3 },
                CounterEvent::Added { amount: 2 }
            ]
        );
        assert!(c.pending_events().is_empty());
        assert!(c.drain_events().is_empty());
    }

    #[test]
    fn event_buffer_is_not_serialized() {
        let mut c = Counter::new("c-2".to_string());
        c.add(1);
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("events").is_none());
    }
}
