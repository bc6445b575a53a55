//! 拦截器管道：仓储操作前后的横切扩展点
//!
//! 拦截器以优先级组成管道，前置与后置钩子都按优先级从高到低执行。
//! 前置钩子可短路整个操作（如缓存命中直接返回），后置钩子与结果
//! 加工钩子遍历全部拦截器。
//!
//! 内置实现：缓存（[`CacheInterceptor`]）、审计（[`AuditInterceptor`]）、
//! 乐观锁（[`OptimisticLockInterceptor`]）。

mod audit;
mod cache;
mod lock;

pub use audit::AuditInterceptor;
pub use cache::CacheInterceptor;
pub use lock::OptimisticLockInterceptor;
pub(crate) use lock::STORED_VERSION_KEY;

use crate::repository::PersistenceObject;
use async_trait::async_trait;
use keel_domain::error::{DomainError, DomainResult};
use keel_domain::specification::CompositeSpecification;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

/// 仓储操作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Get,
    Update,
    Delete,
    Query,
}

/// 一次操作的上下文：拦截器之间以 `data` 传递信息
#[derive(Debug, Clone)]
pub struct InterceptorContext {
    pub operation: OperationKind,
    pub entity_type: &'static str,
    pub entity_id: Option<String>,
    pub actor: Option<String>,
    pub specification: Option<CompositeSpecification>,
    pub data: HashMap<String, Value>,
}

impl InterceptorContext {
    pub fn new(operation: OperationKind, entity_type: &'static str) -> Self {
        Self {
            operation,
            entity_type,
            entity_id: None,
            actor: None,
            specification: None,
            data: HashMap::new(),
        }
    }

    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_specification(mut self, spec: CompositeSpecification) -> Self {
        self.specification = Some(spec);
        self
    }
}

/// 前置钩子的裁决
#[derive(Debug)]
pub enum BeforeOutcome<P> {
    /// 继续执行后续拦截器与实际操作
    Continue,
    /// 短路：以单条结果返回
    One(P),
    /// 短路：以多条结果返回
    Many(Vec<P>),
}

/// 操作结果（后置钩子的只读视图）
#[derive(Debug, Clone)]
pub enum OperationResult<P> {
    None,
    One(P),
    Many(Vec<P>),
    Removed(bool),
}

/// 拦截器协议：默认实现均为空操作，按需覆写
#[async_trait]
pub trait Interceptor<P: PersistenceObject>: Send + Sync {
    fn name(&self) -> &str;

    /// 数值越大越先执行
    fn priority(&self) -> i32 {
        0
    }

    async fn before_operation(
        &self,
        _ctx: &mut InterceptorContext,
        _record: Option<&mut P>,
    ) -> DomainResult<BeforeOutcome<P>> {
        Ok(BeforeOutcome::Continue)
    }

    async fn after_operation(
        &self,
        _ctx: &InterceptorContext,
        _result: &OperationResult<P>,
    ) -> DomainResult<()> {
        Ok(())
    }

    /// 返回前对单条结果加工
    async fn process_result(
        &self,
        _ctx: &InterceptorContext,
        _record: &mut P,
    ) -> DomainResult<()> {
        Ok(())
    }

    /// 批量结果加工，默认逐条委托给 `process_result`
    async fn process_batch_results(
        &self,
        ctx: &InterceptorContext,
        records: &mut [P],
    ) -> DomainResult<()> {
        for record in records.iter_mut() {
            self.process_result(ctx, record).await?;
        }
        Ok(())
    }

    async fn on_error(&self, _ctx: &InterceptorContext, _error: &DomainError) {}
}

/// 按优先级排序的拦截器管道
pub struct InterceptorPipeline<P: PersistenceObject> {
    interceptors: Vec<Arc<dyn Interceptor<P>>>,
}

impl<P: PersistenceObject> Default for InterceptorPipeline<P> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<P: PersistenceObject> InterceptorPipeline<P> {
    pub fn new(mut interceptors: Vec<Arc<dyn Interceptor<P>>>) -> Self {
        interceptors.sort_by_key(|i| Reverse(i.priority()));
        Self { interceptors }
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// 前置阶段：首个非 `Continue` 裁决即短路
    pub async fn before(
        &self,
        ctx: &mut InterceptorContext,
        record: Option<&mut P>,
    ) -> DomainResult<BeforeOutcome<P>> {
        let mut record = record;
        for interceptor in &self.interceptors {
            let reborrow = record.as_mut().map(|r| &mut **r);
            match interceptor.before_operation(ctx, reborrow).await? {
                BeforeOutcome::Continue => {}
                outcome => return Ok(outcome),
            }
        }
        Ok(BeforeOutcome::Continue)
    }

    /// 后置阶段：全部拦截器依次收到结果
    pub async fn after(
        &self,
        ctx: &InterceptorContext,
        result: &OperationResult<P>,
    ) -> DomainResult<()> {
        for interceptor in &self.interceptors {
            interceptor.after_operation(ctx, result).await?;
        }
        Ok(())
    }

    pub async fn process(&self, ctx: &InterceptorContext, record: &mut P) -> DomainResult<()> {
        for interceptor in &self.interceptors {
            interceptor.process_result(ctx, record).await?;
        }
        Ok(())
    }

    pub async fn process_batch(
        &self,
        ctx: &InterceptorContext,
        records: &mut [P],
    ) -> DomainResult<()> {
        for interceptor in &self.interceptors {
            interceptor.process_batch_results(ctx, records).await?;
        }
        Ok(())
    }

    pub async fn error(&self, ctx: &InterceptorContext, error: &DomainError) {
        for interceptor in &self.interceptors {
            interceptor.on_error(ctx, error).await;
        }
    }
}
