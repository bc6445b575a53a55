//! 领域层统一错误定义
//!
//! 聚焦输入校验、并发冲突、幂等/去重、模块装配与基础设施故障等最小必要集合，
//! 便于在各实现层统一转换为 `DomainError`。
//!
//! 分类约定：
//! - `Validation`/`NotFound`/`AlreadyExists`/`StateConflict`：业务侧错误，不重试；
//! - `VersionConflict`/`IdempotencyConflict`/`DuplicateMessage`：并发与重复提交，
//!   需调用方介入，不自动重试；
//! - `Database`/`Cache`/`MessageBus`：瞬态基础设施错误，可由调用方或投递器重试；
//! - `DeliveryExhausted`：Outbox 行重试耗尽后的终态，属运维告警而非请求期错误。
//!
use thiserror::Error;

/// 统一错误类型（基础库最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },

    // --- 业务校验与查找 ---
    #[error("validation error: {reason}")]
    Validation { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("already exists: {reason}")]
    AlreadyExists { reason: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("invalid state: {reason}")]
    StateConflict { reason: String },

    // --- 并发控制与重复提交 ---
    #[error("version conflict: expected={expected}, actual={actual}")]
    VersionConflict { expected: usize, actual: usize },
    #[error("idempotency conflict: key={key}, request hash differs")]
    IdempotencyConflict { key: String },
    #[error("duplicate message: message_id={message_id}")]
    DuplicateMessage { message_id: String },

    // --- 仓储/装配 ---
    #[error("repository error: {reason}")]
    Repository { reason: String },
    #[error("repository not registered for aggregate type: {aggregate_type}")]
    RepositoryNotRegistered { aggregate_type: String },
    #[error("module not found: {module} requires {requires}")]
    ModuleNotFound { module: String, requires: String },
    #[error("module dependency cycle: {path}")]
    ModuleCycle { path: String },

    // --- 基础设施（瞬态，可重试） ---
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("cache error: {reason}")]
    Cache { reason: String },
    #[error("message bus error: {reason}")]
    MessageBus { reason: String },

    // --- 投递终态 ---
    #[error("delivery exhausted: outbox record {id} dead after {attempts} attempts")]
    DeliveryExhausted { id: String, attempts: u32 },
}

impl DomainError {
    /// 是否属于瞬态基础设施错误（调用方可重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::Database { .. }
                | DomainError::Cache { .. }
                | DomainError::MessageBus { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

// ---- Cross-crate conversions for infrastructure convenience ----
// 允许在基础设施层直接使用 `?` 将 sqlx/uuid 等错误转换为 DomainError

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DomainError::NotFound {
                reason: "row not found".to_string(),
            },
            other => DomainError::Database {
                reason: other.to_string(),
            },
        }
    }
}

impl From<uuid::Error> for DomainError {
    fn from(err: uuid::Error) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for DomainError {
    fn from(err: chrono::ParseError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}
