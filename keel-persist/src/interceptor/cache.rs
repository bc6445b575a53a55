//! 缓存拦截器
//!
//! 读路径（Get/Query）前置命中则短路，未命中时在后置阶段回填；
//! 写路径（Create/Update/Delete）在后置阶段失效相关键。
//! 缓存故障一律降级为日志告警，绝不让缓存拖垮主操作。
//!
//! 键格式：
//! - 单条：`{实体类型}:id:{id}`
//! - 查询：`{实体类型}:query:{规约缓存键}`
//! - 失效前缀：`{实体类型}:query:`

use super::{BeforeOutcome, Interceptor, InterceptorContext, OperationKind, OperationResult};
use crate::cache::Cache;
use crate::repository::PersistenceObject;
use async_trait::async_trait;
use keel_domain::error::DomainResult;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub struct CacheInterceptor<P> {
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
    _marker: PhantomData<fn() -> P>,
}

impl<P: PersistenceObject> CacheInterceptor<P> {
    pub fn new(cache: Arc<dyn Cache>, ttl: Option<Duration>) -> Self {
        Self {
            cache,
            ttl,
            _marker: PhantomData,
        }
    }

    fn id_key(id: &str) -> String {
        format!("{}:id:{}", P::ENTITY_TYPE, id)
    }

    fn query_key(ctx: &InterceptorContext) -> Option<String> {
        let spec = ctx.specification.as_ref()?;
        Some(format!("{}:query:{}", P::ENTITY_TYPE, spec.cache_key()))
    }

    fn query_prefix() -> String {
        format!("{}:query:", P::ENTITY_TYPE)
    }

    async fn store(&self, key: &str, value: serde_json::Value) {
        if let Err(e) = self.cache.set(key, value, self.ttl).await {
            tracing::warn!(key, error = %e, "缓存写入失败，已忽略");
        }
    }

    async fn invalidate(&self, ctx: &InterceptorContext) {
        if let Some(id) = &ctx.entity_id
            && let Err(e) = self.cache.delete(&Self::id_key(id)).await
        {
            tracing::warn!(id, error = %e, "缓存失效失败，已忽略");
        }
        if let Err(e) = self.cache.delete_pattern(&Self::query_prefix()).await {
            tracing::warn!(error = %e, "查询缓存批量失效失败，已忽略");
        }
    }
}

#[async_trait]
impl<P: PersistenceObject> Interceptor<P> for CacheInterceptor<P> {
    fn name(&self) -> &str {
        "cache"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn before_operation(
        &self,
        ctx: &mut InterceptorContext,
        _record: Option<&mut P>,
    ) -> DomainResult<BeforeOutcome<P>> {
        match ctx.operation {
            OperationKind::Get => {
                let Some(id) = ctx.entity_id.clone() else {
                    return Ok(BeforeOutcome::Continue);
                };
                match self.cache.get(&Self::id_key(&id)).await {
                    Ok(Some(value)) => match serde_json::from_value::<P>(value) {
                        Ok(record) => return Ok(BeforeOutcome::One(record)),
                        Err(e) => tracing::warn!(id, error = %e, "缓存条目反序列化失败，按未命中处理"),
                    },
                    Ok(None) => {}
                    Err(e) => tracing::warn!(id, error = %e, "缓存读取失败，按未命中处理"),
                }
            }
            OperationKind::Query => {
                let Some(key) = Self::query_key(ctx) else {
                    return Ok(BeforeOutcome::Continue);
                };
                match self.cache.get(&key).await {
                    Ok(Some(value)) => match serde_json::from_value::<Vec<P>>(value) {
                        Ok(records) => return Ok(BeforeOutcome::Many(records)),
                        Err(e) => tracing::warn!(key, error = %e, "缓存条目反序列化失败，按未命中处理"),
                    },
                    Ok(None) => {}
                    Err(e) => tracing::warn!(key, error = %e, "缓存读取失败，按未命中处理"),
                }
            }
            _ => {}
        }
        Ok(BeforeOutcome::Continue)
    }

    async fn after_operation(
        &self,
        ctx: &InterceptorContext,
        result: &OperationResult<P>,
    ) -> DomainResult<()> {
        match ctx.operation {
            OperationKind::Get => {
                if let OperationResult::One(record) = result
                    && let Ok(value) = serde_json::to_value(record)
                {
                    self.store(&Self::id_key(record.id()), value).await;
                }
            }
            OperationKind::Query => {
                if let (OperationResult::Many(records), Some(key)) =
                    (result, Self::query_key(ctx))
                    && let Ok(value) = serde_json::to_value(records)
                {
                    self.store(&key, value).await;
                }
            }
            OperationKind::Create | OperationKind::Update | OperationKind::Delete => {
                self.invalidate(ctx).await;
            }
        }
        Ok(())
    }
}
