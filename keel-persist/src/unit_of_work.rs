//! 工作单元（Unit of Work）：聚合写入与事件外发的原子边界
//!
//! 一次业务用例内的全部仓储写入和 `track` 登记的领域事件进入同一个
//! 暂存区，`commit` 在存储层一次加锁内校验并落库——记录与 Outbox 行
//! 要么同时可见，要么都不可见，从根上消除"写库成功、发消息失败"的
//! 双写缺口。`rollback`（或直接丢弃）丢掉暂存区一切内容。
//!
//! 工厂按聚合类型注册仓储构造方式（映射器 + 拦截器），`begin` 时按
//! 请求上下文生成绑定在同一事务会话上的仓储族。

use crate::context::RequestContext;
use crate::interceptor::{Interceptor, InterceptorPipeline};
use crate::outbox::OutboxRecord;
use crate::repository::{
    AggregateMapper, AggregateRepository, PersistenceObject, Repository, TransactionalRecordStore,
};
use crate::storage::{InMemoryDatabase, TxSession};
use keel_domain::aggregate::Aggregate;
use keel_domain::domain_event::DomainEvent;
use keel_domain::error::{DomainError, DomainResult};
use serde_json::json;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type RepoFactory =
    Arc<dyn Fn(&TxSession, &RequestContext) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// 工作单元工厂：持有存储后端与各聚合类型的仓储构造器
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    db: InMemoryDatabase,
    factories: Arc<HashMap<TypeId, RepoFactory>>,
}

impl UnitOfWorkFactory {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            factories: Arc::new(HashMap::new()),
        }
    }

    /// 注册聚合类型：给定映射器与拦截器，构造绑定事务会话的仓储
    pub fn register<A, P, M>(
        mut self,
        mapper: Arc<M>,
        interceptors: Vec<Arc<dyn Interceptor<P>>>,
    ) -> Self
    where
        A: Aggregate + 'static,
        P: PersistenceObject,
        M: AggregateMapper<A, P> + 'static,
    {
        let pipeline = Arc::new(InterceptorPipeline::new(interceptors));
        let factory: RepoFactory = Arc::new(move |session, ctx| {
            let store = Arc::new(TransactionalRecordStore::<P>::new(session.clone()));
            let repo: Arc<dyn AggregateRepository<A>> = Arc::new(Repository::new(
                store,
                Arc::clone(&mapper),
                Arc::clone(&pipeline),
                ctx.actor.clone(),
            ));
            Box::new(repo)
        });
        let mut factories = (*self.factories).clone();
        factories.insert(TypeId::of::<A>(), factory);
        self.factories = Arc::new(factories);
        self
    }

    /// 开启一个工作单元
    pub fn begin(&self, ctx: RequestContext) -> UnitOfWork {
        UnitOfWork {
            session: TxSession::new(self.db.clone()),
            ctx,
            factories: Arc::clone(&self.factories),
            instances: HashMap::new(),
            finished: false,
        }
    }
}

/// 一次工作单元：同一事务会话上的仓储族与待发事件
pub struct UnitOfWork {
    session: TxSession,
    ctx: RequestContext,
    factories: Arc<HashMap<TypeId, RepoFactory>>,
    instances: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    finished: bool,
}

impl UnitOfWork {
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// 取指定聚合类型的仓储（同一工作单元内复用同一实例）
    pub fn repository<A: Aggregate + 'static>(
        &mut self,
    ) -> DomainResult<Arc<dyn AggregateRepository<A>>> {
        let type_id = TypeId::of::<A>();
        if !self.instances.contains_key(&type_id) {
            let Some(factory) = self.factories.get(&type_id) else {
                return Err(DomainError::RepositoryNotRegistered {
                    aggregate_type: A::TYPE.to_string(),
                });
            };
            let instance = factory(&self.session, &self.ctx);
            self.instances.insert(type_id, instance);
        }
        let instance = self
            .instances
            .get(&type_id)
            .and_then(|b| b.downcast_ref::<Arc<dyn AggregateRepository<A>>>())
            .ok_or_else(|| DomainError::RepositoryNotRegistered {
                aggregate_type: A::TYPE.to_string(),
            })?;
        Ok(Arc::clone(instance))
    }

    /// 登记聚合缓冲的领域事件：抽干事件并转为 Outbox 行进暂存区。
    /// 事件自此只活在暂存区，回滚即随之丢弃。
    pub fn track<A: Aggregate>(&self, aggregate: &mut A) -> DomainResult<()> {
        let events = aggregate.drain_events();
        if events.is_empty() {
            return Ok(());
        }

        let headers = self
            .ctx
            .tenant_id
            .as_ref()
            .map(|tenant| json!({ "tenant_id": tenant }));
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let payload = serde_json::to_value(&event)?;
            let record = OutboxRecord::builder()
                .topic(event.topic())
                .aggregate_type(A::TYPE.to_string())
                .aggregate_id(aggregate.id().to_string())
                .aggregate_version(aggregate.version().value())
                .payload(payload)
                .maybe_headers(headers.clone())
                .build();
            records.push(record);
        }

        let mut staging =
            self.session
                .staging()
                .lock()
                .map_err(|_| DomainError::StateConflict {
                    reason: "事务暂存区锁中毒".to_string(),
                })?;
        if !staging.open {
            return Err(DomainError::StateConflict {
                reason: "工作单元已结束，禁止继续登记事件".to_string(),
            });
        }
        staging.outbox.extend(records);
        Ok(())
    }

    /// 提交：暂存的记录写入与 Outbox 行一次性原子落库。
    /// 任一校验失败则整体不落，工作单元随即结束。
    pub async fn commit(mut self) -> DomainResult<()> {
        let (writes, outbox) = self.session.close();
        self.finished = true;
        self.session.db().apply(writes, outbox)
    }

    /// 回滚：丢弃全部暂存内容
    pub fn rollback(mut self) {
        let _ = self.session.close();
        self.finished = true;
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        // 未显式提交/回滚时按回滚处理
        if !self.finished {
            let _ = self.session.close();
        }
    }
}
