//! 演示：下单 → 工作单元提交 → 投影器投递 → 总线订阅者收到事件

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use keel_domain::aggregate::Aggregate;
use keel_domain::domain_event::DomainEvent;
use keel_domain::entity::Entity;
use keel_domain::error::DomainResult;
use keel_domain::value_object::Version;
use keel_persist::interceptor::{AuditInterceptor, OptimisticLockInterceptor};
use keel_persist::outbox::{InMemoryOutboxStore, OutboxStore};
use keel_persist::repository::{AggregateMapper, PersistenceObject};
use keel_persist::{
    InMemoryDatabase, InMemoryMessageBus, MessageBus, OutboxProjector, RequestContext,
    UnitOfWorkFactory,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OrderEvent {
    Created { order_id: String, amount: i64 },
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &str {
        "order.created"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Order {
    id: String,
    amount: i64,
    #[serde(skip)]
    version: Version,
    #[serde(skip)]
    events: Vec<OrderEvent>,
}

impl Order {
    fn place(id: &str, amount: i64) -> Self {
        let mut order = Self::new(id.to_string());
        order.amount = amount;
        order.record_event(OrderEvent::Created {
            order_id: id.to_string(),
            amount,
        });
        order
    }
}

impl Entity for Order {
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

impl Aggregate for Order {
    const TYPE: &'static str = "order";
    type Event = OrderEvent;

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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderRecord {
    id: String,
    amount: i64,
    version: usize,
    created_by: Option<String>,
    updated_by: Option<String>,
}

impl PersistenceObject for OrderRecord {
    const ENTITY_TYPE: &'static str = "order";

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> usize {
        self.version
    }

    fn set_version(&mut self, version: usize) {
        self.version = version;
    }

    fn touch_created(&mut self, actor: Option<&str>, _at: DateTime<Utc>) {
        self.created_by = actor.map(String::from);
    }

    fn touch_updated(&mut self, actor: Option<&str>, _at: DateTime<Utc>) {
        self.updated_by = actor.map(String::from);
    }
}

struct OrderMapper;

impl AggregateMapper<Order, OrderRecord> for OrderMapper {
    fn to_record(&self, aggregate: &Order) -> DomainResult<OrderRecord> {
        Ok(OrderRecord {
            id: aggregate.id.clone(),
            amount: aggregate.amount,
            version: aggregate.version.value(),
            created_by: None,
            updated_by: None,
        })
    }

    fn to_aggregate(&self, record: OrderRecord) -> DomainResult<Order> {
        Ok(Order {
            id: record.id,
            amount: record.amount,
            version: Version::from(record.version),
            events: Vec::new(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let db = InMemoryDatabase::new();
    let factory = UnitOfWorkFactory::new(db.clone()).register::<Order, OrderRecord, OrderMapper>(
        Arc::new(OrderMapper),
        vec![
            Arc::new(OptimisticLockInterceptor::new()),
            Arc::new(AuditInterceptor::new()),
        ],
    );

    // 订阅总线，旁观事件到达
    let bus = Arc::new(InMemoryMessageBus::new(64));
    let mut stream = bus.subscribe();

    // 一个工作单元：写库与记事件，一次提交
    let mut uow = factory.begin(
        RequestContext::new()
            .with_tenant("acme")
            .with_actor("alice"),
    );
    let repo = uow.repository::<Order>()?;
    let mut order = Order::place("o-1001", 4200);
    repo.create(&order).await?;
    uow.track(&mut order)?;
    uow.commit().await?;
    println!("已提交: 订单 o-1001 与 {} 条 Outbox 行", db.outbox_rows().len());

    // 投影器把台账里的事件推到总线
    let outbox = Arc::new(InMemoryOutboxStore::new(db.clone()));
    let projector = OutboxProjector::builder()
        .outbox(outbox as Arc<dyn OutboxStore>)
        .bus(bus.clone() as Arc<dyn MessageBus>)
        .build();
    let sent = projector.drain_once().await?;
    println!("投影器投递 {sent} 条");

    if let Some(Ok(record)) = stream.next().await {
        println!(
            "订阅者收到: topic={} aggregate={}/{} payload={}",
            record.topic(),
            record.aggregate_type(),
            record.aggregate_id(),
            record.payload()
        );
    }
    Ok(())
}
