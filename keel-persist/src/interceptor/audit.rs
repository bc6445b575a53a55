//! 审计拦截器：写入时盖操作者与时间戳

use super::{BeforeOutcome, Interceptor, InterceptorContext, OperationKind};
use crate::repository::PersistenceObject;
use async_trait::async_trait;
use chrono::Utc;
use keel_domain::error::DomainResult;
use std::marker::PhantomData;

#[derive(Default)]
pub struct AuditInterceptor<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P> AuditInterceptor<P> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: PersistenceObject> Interceptor<P> for AuditInterceptor<P> {
    fn name(&self) -> &str {
        "audit"
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn before_operation(
        &self,
        ctx: &mut InterceptorContext,
        record: Option<&mut P>,
    ) -> DomainResult<BeforeOutcome<P>> {
        if let Some(record) = record {
            let actor = ctx.actor.as_deref();
            match ctx.operation {
                OperationKind::Create => record.touch_created(actor, Utc::now()),
                OperationKind::Update => record.touch_updated(actor, Utc::now()),
                _ => {}
            }
        }
        Ok(BeforeOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Doc {
        id: String,
        version: usize,
        created_by: Option<String>,
        updated_by: Option<String>,
    }

    impl PersistenceObject for Doc {
        const ENTITY_TYPE: &'static str = "doc";

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

    #[tokio::test]
    async fn create_stamps_actor() {
        let interceptor = AuditInterceptor::<Doc>::new();
        let mut ctx = InterceptorContext::new(OperationKind::Create, "doc")
            .with_actor(Some("alice".into()));
        let mut doc = Doc::default();

        interceptor
            .before_operation(&mut ctx, Some(&mut doc))
            .await
            .unwrap();

        assert_eq!(doc.created_by.as_deref(), Some("alice"));
        assert_eq!(doc.updated_by, None);
    }

    #[tokio::test]
    async fn update_stamps_actor() {
        let interceptor = AuditInterceptor::<Doc>::new();
        let mut ctx =
            InterceptorContext::new(OperationKind::Update, "doc").with_actor(Some("bob".into()));
        let mut doc = Doc::default();

        interceptor
            .before_operation(&mut ctx, Some(&mut doc))
            .await
            .unwrap();

        assert_eq!(doc.updated_by.as_deref(), Some("bob"));
        assert_eq!(doc.created_by, None);
    }
}
