//! 请求作用域上下文（RequestContext）
//!
//! 承载一次调用所需的横切信息，由调用方显式传递，不依赖任何
//! 线程/任务局部的隐式状态：
//! - 租户（`tenant_id`）：多租户隔离与 Outbox 行的租户标头；
//! - 执行者（`actor`）：审计拦截器的 created_by/updated_by 来源；
//! - 关联 ID（`correlation_id`）：链路追踪；
//! - 幂等键（`idempotency_key`)：命令重复提交保护。
//!
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// 租户标识（可选）
    pub tenant_id: Option<String>,
    /// 执行者标识（审计主体）
    pub actor: Option<String>,
    /// 关联 ID（链路追踪）
    pub correlation_id: Option<String>,
    /// 幂等键（可选）：为空则由上层决定是否参与幂等
    pub idempotency_key: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
