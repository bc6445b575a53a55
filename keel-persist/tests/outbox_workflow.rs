//! 端到端：工作单元提交 → Outbox 落台账 → 投影器投递 → 总线可见

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_domain::aggregate::Aggregate;
use keel_domain::domain_event::DomainEvent;
use keel_domain::entity::Entity;
use keel_domain::error::{DomainError, DomainResult};
use keel_domain::specification::CompositeSpecification;
use keel_domain::value_object::Version;
use keel_persist::interceptor::{AuditInterceptor, OptimisticLockInterceptor};
use keel_persist::outbox::{InMemoryOutboxStore, OutboxRecord, OutboxStatus, OutboxStore};
use keel_persist::repository::{AggregateMapper, PersistenceObject};
use keel_persist::{
    InMemoryDatabase, MessageBus, OutboxProjector, RequestContext, UnitOfWorkFactory,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OrderEvent {
    Created { order_id: String, amount: i64 },
    StatusChanged { order_id: String, status: String },
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &str {
        match self {
            OrderEvent::Created { .. } => "order.created",
            OrderEvent::StatusChanged { .. } => "order.status_changed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Order {
    id: String,
    amount: i64,
    status: String,
    #[serde(skip)]
    version: Version,
    #[serde(skip)]
    events: Vec<OrderEvent>,
}

impl Order {
    fn place(id: &str, amount: i64) -> Self {
        let mut order = Self::new(id.to_string());
        order.amount = amount;
        order.status = "placed".into();
        order.record_event(OrderEvent::Created {
            order_id: id.to_string(),
            amount,
        });
        order
    }

    fn ship(&mut self) {
        self.status = "shipped".into();
        self.record_event(OrderEvent::StatusChanged {
            order_id: self.id.clone(),
            status: self.status.clone(),
        });
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
    status: String,
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
            status: aggregate.status.clone(),
            version: aggregate.version.value(),
            created_by: None,
            updated_by: None,
        })
    }

    fn to_aggregate(&self, record: OrderRecord) -> DomainResult<Order> {
        Ok(Order {
            id: record.id,
            amount: record.amount,
            status: record.status,
            version: Version::from(record.version),
            events: Vec::new(),
        })
    }
}

struct RecordingBus {
    received: Mutex<Vec<OutboxRecord>>,
}

impl RecordingBus {
    fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
        }
    }

    fn topics(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.topic().to_string())
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, record: &OutboxRecord) -> DomainResult<()> {
        self.received.lock().unwrap().push(record.clone());
        Ok(())
    }
}

fn factory(db: &InMemoryDatabase) -> UnitOfWorkFactory {
    UnitOfWorkFactory::new(db.clone()).register::<Order, OrderRecord, OrderMapper>(
        Arc::new(OrderMapper),
        vec![
            Arc::new(OptimisticLockInterceptor::new()),
            Arc::new(AuditInterceptor::new()),
        ],
    )
}

#[tokio::test]
async fn committed_unit_of_work_feeds_projector_to_bus() {
    let db = InMemoryDatabase::new();
    let factory = factory(&db);

    // 用例：下单后立即发货，两个事件进同一个工作单元
    let mut uow = factory.begin(
        RequestContext::new()
            .with_tenant("acme")
            .with_actor("alice"),
    );
    let repo = uow.repository::<Order>().unwrap();
    let mut order = Order::place("o-1", 500);
    order.ship();
    repo.create(&order).await.unwrap();
    uow.track(&mut order).unwrap();
    uow.commit().await.unwrap();

    // 事件按发生序落台账，且携带租户标头
    let rows = db.outbox_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].topic(), "order.created");
    assert_eq!(rows[1].topic(), "order.status_changed");
    assert!(rows.iter().all(|r| r.tenant_id() == Some("acme")));
    assert!(rows.iter().all(|r| r.status() == OutboxStatus::New));

    // 投影器领取并投递
    let outbox = Arc::new(InMemoryOutboxStore::new(db.clone()));
    let bus = Arc::new(RecordingBus::new());
    let projector = OutboxProjector::builder()
        .outbox(outbox.clone() as Arc<dyn OutboxStore>)
        .bus(bus.clone() as Arc<dyn MessageBus>)
        .build();

    let sent = projector.drain_once().await.unwrap();
    assert_eq!(sent, 2);
    assert_eq!(bus.topics(), vec!["order.created", "order.status_changed"]);
    assert_eq!(
        outbox
            .find_by_status(OutboxStatus::Sent, 10)
            .await
            .unwrap()
            .len(),
        2
    );

    // 再领一次什么都没有：不会重复投递
    assert_eq!(projector.drain_once().await.unwrap(), 0);
}

#[tokio::test]
async fn rolled_back_unit_of_work_leaves_no_trace() {
    let db = InMemoryDatabase::new();
    let factory = factory(&db);

    let mut uow = factory.begin(RequestContext::new());
    let repo = uow.repository::<Order>().unwrap();
    let mut order = Order::place("o-1", 500);
    repo.create(&order).await.unwrap();
    uow.track(&mut order).unwrap();
    uow.rollback();

    assert!(db.get("order", "o-1").is_none());
    assert!(db.outbox_rows().is_empty());
}

#[tokio::test]
async fn unregistered_aggregate_type_is_rejected() {
    #[derive(Debug, Clone, Serialize)]
    struct NoopEvent;
    impl DomainEvent for NoopEvent {
        fn event_type(&self) -> &str {
            "noop"
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Invoice {
        id: String,
        #[serde(skip)]
        version: Version,
    }
    impl Entity for Invoice {
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
    impl Aggregate for Invoice {
        const TYPE: &'static str = "invoice";
        type Event = NoopEvent;
        fn record_event(&mut self, _event: Self::Event) {}
        fn pending_events(&self) -> &[Self::Event] {
            &[]
        }
        fn drain_events(&mut self) -> Vec<Self::Event> {
            Vec::new()
        }
    }

    let db = InMemoryDatabase::new();
    let factory = factory(&db);
    let mut uow = factory.begin(RequestContext::new());

    let err = uow.repository::<Invoice>().err().unwrap();
    assert!(matches!(
        err,
        DomainError::RepositoryNotRegistered { aggregate_type } if aggregate_type == "invoice"
    ));
}

#[tokio::test]
async fn in_memory_eval_agrees_with_store_query() {
    let db = InMemoryDatabase::new();
    let factory = factory(&db);

    let mut uow = factory.begin(RequestContext::new());
    let repo = uow.repository::<Order>().unwrap();
    for (id, amount, status) in [
        ("o-1", 100, "placed"),
        ("o-2", 250, "shipped"),
        ("o-3", 900, "placed"),
    ] {
        let mut order = Order::place(id, amount);
        if status == "shipped" {
            order.ship();
        }
        repo.create(&order).await.unwrap();
        uow.track(&mut order).unwrap();
    }
    uow.commit().await.unwrap();

    let spec = CompositeSpecification::builder()
        .eq("status", json!("placed"))
        .between("amount", json!(50), json!(500))
        .build();

    // 存储路径
    let mut uow = factory.begin(RequestContext::new());
    let repo = uow.repository::<Order>().unwrap();
    let found = repo.find(spec.clone()).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["o-1"]);

    // 内存判定路径给出一致结论
    for (id, row) in db.scan("order") {
        let expected = found.iter().any(|o| o.id == id);
        assert_eq!(spec.is_satisfied_by(&row.value), expected, "记录 {id}");
    }

    // 嵌套 OR 组：任一分支命中即命中，两条路径仍一致
    let or_spec = spec.or(CompositeSpecification::builder()
        .eq("status", json!("shipped"))
        .build());
    let found = repo.find(or_spec.clone()).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["o-1", "o-2"]);
    for (id, row) in db.scan("order") {
        let expected = found.iter().any(|o| o.id == id);
        assert_eq!(or_spec.is_satisfied_by(&row.value), expected, "记录 {id}");
    }
}
