//! 查询参数导出（QueryParams）
//!
//! `CompositeSpecification::to_query_params` 的产物：规约全部子句的无损
//! 镜像，可序列化后交由存储实现翻译为具体查询（SQL、文档查询等）。
//!
use super::filter::{Aggregation, Filter, FilterGroup, Page, Sort};
use serde::{Deserialize, Serialize};

/// 一次查询的全部子句（无损导出）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub filters: Vec<Filter>,
    pub groups: Vec<FilterGroup>,
    pub sorts: Vec<Sort>,
    pub page: Option<Page>,
    pub fields: Vec<String>,
    pub includes: Vec<String>,
    pub aggregation: Option<Aggregation>,
}
