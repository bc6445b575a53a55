//! 仓储：聚合 ↔ 持久化对象的映射与记录存储
//!
//! 分三层：
//! - [`RecordStore`]：面向持久化对象的底层读写（直连库或挂在事务会话上）；
//! - [`AggregateMapper`]：聚合与持久化对象（PO）之间的双向映射；
//! - [`Repository`]：对外的聚合仓储，CRUD 与查询都穿过拦截器管道。
//!
//! count/exists/唯一性/随机抽样等统计类读操作绕过管道，避免污染缓存。

use crate::interceptor::{
    BeforeOutcome, InterceptorContext, InterceptorPipeline, OperationKind, OperationResult,
    STORED_VERSION_KEY,
};
use crate::storage::{InMemoryDatabase, StagedWrite, TxSession, filter_only, filter_sort_page, run_aggregation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_domain::aggregate::Aggregate;
use keel_domain::error::{DomainError, DomainResult};
use keel_domain::specification::CompositeSpecification;
use keel_domain::value_object::Version;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

/// 持久化对象协议：可序列化、带版本列、可盖审计戳
pub trait PersistenceObject:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 实体类型名，同时是存储表名与缓存键前缀
    const ENTITY_TYPE: &'static str;

    fn id(&self) -> &str;

    fn version(&self) -> usize;

    fn set_version(&mut self, version: usize);

    fn touch_created(&mut self, actor: Option<&str>, at: DateTime<Utc>);

    fn touch_updated(&mut self, actor: Option<&str>, at: DateTime<Utc>);
}

/// 聚合与持久化对象的双向映射
pub trait AggregateMapper<A, P>: Send + Sync {
    fn to_record(&self, aggregate: &A) -> DomainResult<P>;

    fn to_aggregate(&self, record: P) -> DomainResult<A>;
}

/// 记录存储协议
#[async_trait]
pub trait RecordStore<P: PersistenceObject>: Send + Sync {
    async fn insert(&self, record: P) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<P>>;

    async fn get_many(&self, ids: &[String]) -> DomainResult<Vec<P>>;

    /// `expected_version` 为 Some 时做条件更新，不匹配报版本冲突
    async fn update(&self, record: P, expected_version: Option<usize>) -> DomainResult<()>;

    async fn delete(&self, id: &str) -> DomainResult<bool>;

    async fn delete_many(&self, ids: &[String]) -> DomainResult<usize>;

    async fn query(&self, spec: &CompositeSpecification) -> DomainResult<Vec<P>>;

    async fn count(&self, spec: &CompositeSpecification) -> DomainResult<u64>;

    async fn aggregate(&self, spec: &CompositeSpecification) -> DomainResult<Vec<Value>>;

    /// 随机抽取至多 n 条满足规约的记录
    async fn sample(&self, spec: &CompositeSpecification, n: usize) -> DomainResult<Vec<P>>;
}

fn decode<P: PersistenceObject>(value: Value) -> DomainResult<P> {
    serde_json::from_value(value).map_err(DomainError::from)
}

fn decode_all<P: PersistenceObject>(values: Vec<Value>) -> DomainResult<Vec<P>> {
    values.into_iter().map(decode).collect()
}

/// 直连内存库的记录存储（不走工作单元的读与独立写）
pub struct InMemoryRecordStore<P> {
    db: InMemoryDatabase,
    _marker: PhantomData<fn() -> P>,
}

impl<P: PersistenceObject> InMemoryRecordStore<P> {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            _marker: PhantomData,
        }
    }

    fn rows(&self) -> Vec<Value> {
        self.db
            .scan(P::ENTITY_TYPE)
            .into_iter()
            .map(|(_, r)| r.value)
            .collect()
    }
}

#[async_trait]
impl<P: PersistenceObject> RecordStore<P> for InMemoryRecordStore<P> {
    async fn insert(&self, record: P) -> DomainResult<()> {
        let value = serde_json::to_value(&record)?;
        self.db
            .insert(P::ENTITY_TYPE, record.id(), value, record.version())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<P>> {
        self.db
            .get(P::ENTITY_TYPE, id)
            .map(|r| decode(r.value))
            .transpose()
    }

    async fn get_many(&self, ids: &[String]) -> DomainResult<Vec<P>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.db.get(P::ENTITY_TYPE, id) {
                out.push(decode(record.value)?);
            }
        }
        Ok(out)
    }

    async fn update(&self, record: P, expected_version: Option<usize>) -> DomainResult<()> {
        let value = serde_json::to_value(&record)?;
        self.db.update(
            P::ENTITY_TYPE,
            record.id(),
            value,
            expected_version,
            record.version(),
        )
    }

    async fn delete(&self, id: &str) -> DomainResult<bool> {
        Ok(self.db.delete(P::ENTITY_TYPE, id))
    }

    async fn delete_many(&self, ids: &[String]) -> DomainResult<usize> {
        Ok(ids
            .iter()
            .filter(|id| self.db.delete(P::ENTITY_TYPE, id))
            .count())
    }

    async fn query(&self, spec: &CompositeSpecification) -> DomainResult<Vec<P>> {
        decode_all(filter_sort_page(self.rows(), spec))
    }

    async fn count(&self, spec: &CompositeSpecification) -> DomainResult<u64> {
        Ok(filter_only(self.rows(), spec).len() as u64)
    }

    async fn aggregate(&self, spec: &CompositeSpecification) -> DomainResult<Vec<Value>> {
        let Some(aggregation) = spec.aggregation() else {
            return Err(DomainError::Validation {
                reason: "规约未携带聚合定义".to_string(),
            });
        };
        let rows = filter_only(self.rows(), spec);
        Ok(run_aggregation(&rows, aggregation))
    }

    async fn sample(&self, spec: &CompositeSpecification, n: usize) -> DomainResult<Vec<P>> {
        let rows = filter_only(self.rows(), spec);
        let picked: Vec<Value> = rows
            .choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect();
        decode_all(picked)
    }
}

/// 挂在工作单元会话上的记录存储：读带暂存叠加，写进暂存区
pub struct TransactionalRecordStore<P> {
    session: TxSession,
    _marker: PhantomData<fn() -> P>,
}

impl<P: PersistenceObject> TransactionalRecordStore<P> {
    pub(crate) fn new(session: TxSession) -> Self {
        Self {
            session,
            _marker: PhantomData,
        }
    }

    /// 本事务对单条记录的净效果：Some(Some) 改写、Some(None) 已删、None 未触碰
    fn staged_effect(&self, id: &str) -> DomainResult<Option<Option<(Value, usize)>>> {
        let staging = self
            .session
            .staging()
            .lock()
            .map_err(|_| DomainError::StateConflict {
                reason: "事务暂存区锁中毒".to_string(),
            })?;
        if !staging.open {
            return Err(DomainError::StateConflict {
                reason: "工作单元已结束，禁止继续访问".to_string(),
            });
        }
        let mut effect = None;
        for write in &staging.writes {
            match write {
                StagedWrite::Upsert {
                    table,
                    id: wid,
                    value,
                    new_version,
                    ..
                } if table == P::ENTITY_TYPE && wid == id => {
                    effect = Some(Some((value.clone(), *new_version)));
                }
                StagedWrite::Delete { table, id: wid }
                    if table == P::ENTITY_TYPE && wid == id =>
                {
                    effect = Some(None);
                }
                _ => {}
            }
        }
        Ok(effect)
    }

    /// 当前记录（库底 + 暂存叠加）的载荷与版本
    fn effective(&self, id: &str) -> DomainResult<Option<(Value, usize)>> {
        match self.staged_effect(id)? {
            Some(effect) => Ok(effect),
            None => Ok(self
                .session
                .db()
                .get(P::ENTITY_TYPE, id)
                .map(|r| (r.value, r.version))),
        }
    }

    /// 全表的叠加视图
    fn effective_rows(&self) -> DomainResult<Vec<Value>> {
        let mut rows: std::collections::BTreeMap<String, Value> = self
            .session
            .db()
            .scan(P::ENTITY_TYPE)
            .into_iter()
            .map(|(id, r)| (id, r.value))
            .collect();

        let staging = self
            .session
            .staging()
            .lock()
            .map_err(|_| DomainError::StateConflict {
                reason: "事务暂存区锁中毒".to_string(),
            })?;
        if !staging.open {
            return Err(DomainError::StateConflict {
                reason: "工作单元已结束，禁止继续访问".to_string(),
            });
        }
        for write in &staging.writes {
            match write {
                StagedWrite::Upsert {
                    table, id, value, ..
                } if table == P::ENTITY_TYPE => {
                    rows.insert(id.clone(), value.clone());
                }
                StagedWrite::Delete { table, id } if table == P::ENTITY_TYPE => {
                    rows.remove(id);
                }
                _ => {}
            }
        }
        Ok(rows.into_values().collect())
    }

    fn stage(&self, write: StagedWrite) -> DomainResult<()> {
        let mut staging =
            self.session
                .staging()
                .lock()
                .map_err(|_| DomainError::StateConflict {
                    reason: "事务暂存区锁中毒".to_string(),
                })?;
        if !staging.open {
            return Err(DomainError::StateConflict {
                reason: "工作单元已结束，禁止继续写入".to_string(),
            });
        }
        staging.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl<P: PersistenceObject> RecordStore<P> for TransactionalRecordStore<P> {
    async fn insert(&self, record: P) -> DomainResult<()> {
        if self.effective(record.id())?.is_some() {
            return Err(DomainError::AlreadyExists {
                reason: format!("{}/{}", P::ENTITY_TYPE, record.id()),
            });
        }
        let value = serde_json::to_value(&record)?;
        self.stage(StagedWrite::Upsert {
            table: P::ENTITY_TYPE.to_string(),
            id: record.id().to_string(),
            value,
            expected_version: None,
            new_version: record.version(),
            create: true,
        })
    }

    async fn get(&self, id: &str) -> DomainResult<Option<P>> {
        self.effective(id)?.map(|(v, _)| decode(v)).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> DomainResult<Vec<P>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((value, _)) = self.effective(id)? {
                out.push(decode(value)?);
            }
        }
        Ok(out)
    }

    async fn update(&self, record: P, expected_version: Option<usize>) -> DomainResult<()> {
        let Some((_, current)) = self.effective(record.id())? else {
            return Err(DomainError::NotFound {
                reason: format!("{}/{}", P::ENTITY_TYPE, record.id()),
            });
        };
        if let Some(expected) = expected_version
            && current != expected
        {
            return Err(DomainError::VersionConflict {
                expected,
                actual: current,
            });
        }
        let value = serde_json::to_value(&record)?;
        self.stage(StagedWrite::Upsert {
            table: P::ENTITY_TYPE.to_string(),
            id: record.id().to_string(),
            value,
            expected_version,
            new_version: record.version(),
            create: false,
        })
    }

    async fn delete(&self, id: &str) -> DomainResult<bool> {
        if self.effective(id)?.is_none() {
            return Ok(false);
        }
        self.stage(StagedWrite::Delete {
            table: P::ENTITY_TYPE.to_string(),
            id: id.to_string(),
        })?;
        Ok(true)
    }

    async fn delete_many(&self, ids: &[String]) -> DomainResult<usize> {
        let mut removed = 0;
        for id in ids {
            if self.delete(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn query(&self, spec: &CompositeSpecification) -> DomainResult<Vec<P>> {
        decode_all(filter_sort_page(self.effective_rows()?, spec))
    }

    async fn count(&self, spec: &CompositeSpecification) -> DomainResult<u64> {
        Ok(filter_only(self.effective_rows()?, spec).len() as u64)
    }

    async fn aggregate(&self, spec: &CompositeSpecification) -> DomainResult<Vec<Value>> {
        let Some(aggregation) = spec.aggregation() else {
            return Err(DomainError::Validation {
                reason: "规约未携带聚合定义".to_string(),
            });
        };
        let rows = filter_only(self.effective_rows()?, spec);
        Ok(run_aggregation(&rows, aggregation))
    }

    async fn sample(&self, spec: &CompositeSpecification, n: usize) -> DomainResult<Vec<P>> {
        let rows = filter_only(self.effective_rows()?, spec);
        let picked: Vec<Value> = rows
            .choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect();
        decode_all(picked)
    }
}

/// 聚合仓储协议（对象安全，工作单元按类型分发）
#[async_trait]
pub trait AggregateRepository<A: Aggregate>: Send + Sync {
    async fn create(&self, aggregate: &A) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<A>>;

    async fn get_many(&self, ids: &[String]) -> DomainResult<Vec<A>>;

    /// 成功后把推进的版本写回聚合
    async fn update(&self, aggregate: &mut A) -> DomainResult<()>;

    async fn delete(&self, id: &str) -> DomainResult<bool>;

    async fn delete_many(&self, ids: &[String]) -> DomainResult<usize>;

    async fn find(&self, spec: CompositeSpecification) -> DomainResult<Vec<A>>;

    async fn find_one(&self, spec: CompositeSpecification) -> DomainResult<Option<A>>;

    async fn count(&self, spec: CompositeSpecification) -> DomainResult<u64>;

    async fn exists(&self, spec: CompositeSpecification) -> DomainResult<bool>;

    /// 字段值是否在表内唯一；`exclude_id` 用于更新自检
    async fn is_unique(
        &self,
        field: &str,
        value: Value,
        exclude_id: Option<&str>,
    ) -> DomainResult<bool>;

    async fn aggregate_stats(&self, spec: CompositeSpecification) -> DomainResult<Vec<Value>>;

    async fn random_one(&self, spec: CompositeSpecification) -> DomainResult<Option<A>>;

    async fn random_many(&self, spec: CompositeSpecification, n: usize) -> DomainResult<Vec<A>>;

    /// 按百分比抽样（0 < pct <= 100）
    async fn sample_percent(&self, spec: CompositeSpecification, pct: f64) -> DomainResult<Vec<A>>;
}

/// 聚合仓储实现：CRUD 与查询穿过拦截器管道
pub struct Repository<A, P: PersistenceObject, M> {
    store: Arc<dyn RecordStore<P>>,
    mapper: Arc<M>,
    pipeline: Arc<InterceptorPipeline<P>>,
    actor: Option<String>,
    _marker: PhantomData<fn() -> A>,
}

impl<A, P, M> Repository<A, P, M>
where
    A: Aggregate,
    P: PersistenceObject,
    M: AggregateMapper<A, P>,
{
    pub fn new(
        store: Arc<dyn RecordStore<P>>,
        mapper: Arc<M>,
        pipeline: Arc<InterceptorPipeline<P>>,
        actor: Option<String>,
    ) -> Self {
        Self {
            store,
            mapper,
            pipeline,
            actor,
            _marker: PhantomData,
        }
    }

    fn ctx(&self, operation: OperationKind) -> InterceptorContext {
        InterceptorContext::new(operation, P::ENTITY_TYPE).with_actor(self.actor.clone())
    }

    fn to_aggregates(&self, records: Vec<P>) -> DomainResult<Vec<A>> {
        records
            .into_iter()
            .map(|r| self.mapper.to_aggregate(r))
            .collect()
    }
}

#[async_trait]
impl<A, P, M> AggregateRepository<A> for Repository<A, P, M>
where
    A: Aggregate,
    P: PersistenceObject,
    M: AggregateMapper<A, P> + 'static,
{
    async fn create(&self, aggregate: &A) -> DomainResult<()> {
        let mut record = self.mapper.to_record(aggregate)?;
        let mut ctx = self.ctx(OperationKind::Create).with_entity_id(record.id());

        self.pipeline.before(&mut ctx, Some(&mut record)).await?;
        if let Err(e) = self.store.insert(record.clone()).await {
            self.pipeline.error(&ctx, &e).await;
            return Err(e);
        }
        self.pipeline
            .after(&ctx, &OperationResult::One(record))
            .await
    }

    async fn get(&self, id: &str) -> DomainResult<Option<A>> {
        let mut ctx = self.ctx(OperationKind::Get).with_entity_id(id);

        if let BeforeOutcome::One(record) = self.pipeline.before(&mut ctx, None).await? {
            return Ok(Some(self.mapper.to_aggregate(record)?));
        }
        let Some(mut record) = self.store.get(id).await? else {
            self.pipeline.after(&ctx, &OperationResult::None).await?;
            return Ok(None);
        };
        self.pipeline.process(&ctx, &mut record).await?;
        self.pipeline
            .after(&ctx, &OperationResult::One(record.clone()))
            .await?;
        Ok(Some(self.mapper.to_aggregate(record)?))
    }

    async fn get_many(&self, ids: &[String]) -> DomainResult<Vec<A>> {
        let ctx = self.ctx(OperationKind::Get);
        let mut records = self.store.get_many(ids).await?;
        self.pipeline.process_batch(&ctx, &mut records).await?;
        self.to_aggregates(records)
    }

    async fn update(&self, aggregate: &mut A) -> DomainResult<()> {
        let mut record = self.mapper.to_record(aggregate)?;
        let id = record.id().to_string();
        let mut ctx = self.ctx(OperationKind::Update).with_entity_id(&id);

        let Some(stored) = self.store.get(&id).await? else {
            return Err(DomainError::NotFound {
                reason: format!("{}/{}", P::ENTITY_TYPE, id),
            });
        };
        let stored_version = stored.version();
        ctx.data
            .insert(STORED_VERSION_KEY.into(), json!(stored_version));

        self.pipeline.before(&mut ctx, Some(&mut record)).await?;
        // 管道中没有乐观锁拦截器时由仓储自行推进版本
        if record.version() <= stored_version {
            record.set_version(stored_version + 1);
        }

        if let Err(e) = self
            .store
            .update(record.clone(), Some(stored_version))
            .await
        {
            self.pipeline.error(&ctx, &e).await;
            return Err(e);
        }
        aggregate.set_version(Version::from(record.version()));
        self.pipeline
            .after(&ctx, &OperationResult::One(record))
            .await
    }

    async fn delete(&self, id: &str) -> DomainResult<bool> {
        let mut ctx = self.ctx(OperationKind::Delete).with_entity_id(id);
        self.pipeline.before(&mut ctx, None).await?;

        let removed = match self.store.delete(id).await {
            Ok(removed) => removed,
            Err(e) => {
                self.pipeline.error(&ctx, &e).await;
                return Err(e);
            }
        };
        self.pipeline
            .after(&ctx, &OperationResult::Removed(removed))
            .await?;
        Ok(removed)
    }

    async fn delete_many(&self, ids: &[String]) -> DomainResult<usize> {
        let mut removed = 0;
        for id in ids {
            if self.delete(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find(&self, spec: CompositeSpecification) -> DomainResult<Vec<A>> {
        let mut ctx = self
            .ctx(OperationKind::Query)
            .with_specification(spec.clone());

        if let BeforeOutcome::Many(records) = self.pipeline.before(&mut ctx, None).await? {
            return self.to_aggregates(records);
        }
        let mut records = self.store.query(&spec).await?;
        self.pipeline.process_batch(&ctx, &mut records).await?;
        self.pipeline
            .after(&ctx, &OperationResult::Many(records.clone()))
            .await?;
        self.to_aggregates(records)
    }

    async fn find_one(&self, spec: CompositeSpecification) -> DomainResult<Option<A>> {
        Ok(self.find(spec).await?.into_iter().next())
    }

    async fn count(&self, spec: CompositeSpecification) -> DomainResult<u64> {
        self.store.count(&spec).await
    }

    async fn exists(&self, spec: CompositeSpecification) -> DomainResult<bool> {
        Ok(self.store.count(&spec).await? > 0)
    }

    async fn is_unique(
        &self,
        field: &str,
        value: Value,
        exclude_id: Option<&str>,
    ) -> DomainResult<bool> {
        let spec = CompositeSpecification::builder().eq(field, value).build();
        let matches = self.store.query(&spec).await?;
        Ok(matches
            .iter()
            .all(|r| exclude_id.is_some_and(|id| r.id() == id)))
    }

    async fn aggregate_stats(&self, spec: CompositeSpecification) -> DomainResult<Vec<Value>> {
        self.store.aggregate(&spec).await
    }

    async fn random_one(&self, spec: CompositeSpecification) -> DomainResult<Option<A>> {
        Ok(self.random_many(spec, 1).await?.into_iter().next())
    }

    async fn random_many(&self, spec: CompositeSpecification, n: usize) -> DomainResult<Vec<A>> {
        let records = self.store.sample(&spec, n).await?;
        self.to_aggregates(records)
    }

    async fn sample_percent(&self, spec: CompositeSpecification, pct: f64) -> DomainResult<Vec<A>> {
        if !(0.0..=100.0).contains(&pct) || pct == 0.0 {
            return Err(DomainError::Validation {
                reason: format!("抽样百分比必须在 (0, 100] 内: {pct}"),
            });
        }
        let total = self.store.count(&spec).await? as f64;
        let n = ((total * pct / 100.0).ceil() as usize).max(1);
        self.random_many(spec, n).await
    }
}
