//! 持久化可靠性内核（keel-persist）
//!
//! 在 `keel-domain` 的领域抽象之上提供分布式正确性所需的基础设施：
//! - 工作单元（`unit_of_work`）：事务边界，聚合写入与 Outbox 追加同事务提交，
//!   杜绝双写；
//! - Outbox / Inbox（`outbox`/`inbox`）：事务性出站事件台账与去重入站台账；
//! - 幂等存储（`idempotency`）：命令结果的键值缓存与请求哈希冲突检测；
//! - 拦截器管线（`interceptor`）：按优先级包裹仓储操作的缓存/审计/乐观锁中间件；
//! - 仓储适配器（`repository`）：聚合与持久化对象的通用映射与规约查询；
//! - 投递器（`projector`）：轮询 Outbox 并发布到消息总线的长驻后台任务；
//! - 模块注册表（`module`）：依赖序启动/逆序关闭的可插拔装配单元。
//!
//! 存储、缓存与总线均以协议（trait）定义，内置的内存实现用于测试、示例
//! 与本地开发；生产环境由上层提供具体后端并注入。
//!
pub mod bus;
pub mod cache;
pub mod context;
pub mod idempotency;
pub mod inbox;
pub mod interceptor;
pub mod module;
pub mod outbox;
pub mod projector;
pub mod repository;
pub mod storage;
pub mod unit_of_work;

pub use bus::{InMemoryMessageBus, MessageBus};
pub use cache::{Cache, InMemoryCache};
pub use context::RequestContext;
pub use idempotency::{
    IdempotencyKey, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    InMemoryIdempotencyStore, ReplayDecision, hash_request,
};
pub use inbox::{InMemoryInboxStore, InboxRecord, InboxStore};
pub use interceptor::{
    AuditInterceptor, BeforeOutcome, CacheInterceptor, Interceptor, InterceptorContext,
    InterceptorPipeline, OperationKind, OperationResult, OptimisticLockInterceptor,
};
pub use module::{Module, ModuleRegistry, ServiceContainer};
pub use outbox::{InMemoryOutboxStore, OutboxRecord, OutboxStatus, OutboxStore};
pub use projector::{OutboxProjector, ProjectorConfig, ProjectorHandle};
pub use repository::{
    AggregateMapper, AggregateRepository, InMemoryRecordStore, PersistenceObject, RecordStore,
    Repository,
};
pub use storage::InMemoryDatabase;
pub use unit_of_work::{UnitOfWork, UnitOfWorkFactory};
