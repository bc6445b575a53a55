//! 乐观锁拦截器
//!
//! 更新前比对调用方持有的版本与存储中的版本（由仓储放入
//! `ctx.data["stored_version"]`），不一致即拒绝；一致则把版本推进
//! 一位，由存储层在落库时再做一次带版本的条件更新兜底。

use super::{BeforeOutcome, Interceptor, InterceptorContext, OperationKind};
use crate::repository::PersistenceObject;
use async_trait::async_trait;
use keel_domain::error::{DomainError, DomainResult};
use std::marker::PhantomData;

/// 仓储在更新前写入的存储版本键
pub(crate) const STORED_VERSION_KEY: &str = "stored_version";

#[derive(Default)]
pub struct OptimisticLockInterceptor<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P> OptimisticLockInterceptor<P> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: PersistenceObject> Interceptor<P> for OptimisticLockInterceptor<P> {
    fn name(&self) -> &str {
        "optimistic_lock"
    }

    fn priority(&self) -> i32 {
        75
    }

    async fn before_operation(
        &self,
        ctx: &mut InterceptorContext,
        record: Option<&mut P>,
    ) -> DomainResult<BeforeOutcome<P>> {
        if ctx.operation != OperationKind::Update {
            return Ok(BeforeOutcome::Continue);
        }
        let Some(record) = record else {
            return Ok(BeforeOutcome::Continue);
        };
        let Some(stored) = ctx
            .data
            .get(STORED_VERSION_KEY)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
        else {
            return Ok(BeforeOutcome::Continue);
        };

        if record.version() != stored {
            return Err(DomainError::VersionConflict {
                expected: record.version(),
                actual: stored,
            });
        }
        record.set_version(stored + 1);
        Ok(BeforeOutcome::Continue)
    }
}
