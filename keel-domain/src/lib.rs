//! 领域层基础库（keel-domain）
//!
//! 提供持久化可靠性内核所需的领域层抽象与构件：
//! - 实体（`entity`）与聚合（`aggregate`）建模，聚合内置事件缓冲；
//! - 领域事件（`domain_event`）：出站事件的最小载荷接口；
//! - 规约（`specification`）：可组合的过滤/分组/排序/分页查询代数，
//!   支持内存求值与无损导出查询参数；
//! - 值对象（`value_object`）：版本号等乐观锁基础类型；
//! - 统一错误类型（`error`）。
//!
//! 本 crate 不依赖异步运行时与具体存储实现，仅定义领域层接口与最小必要
//! 的错误类型，由 `keel-persist` 在其上提供事务边界、Outbox/Inbox、
//! 幂等存储与拦截器管线等基础设施。
//!
pub mod aggregate;
pub mod domain_event;
pub mod entity;
pub mod error;
pub mod specification;
pub mod value_object;
