//! 规约（Specification）/ 查询代数
//!
//! 以不可变值对象表达查询条件：
//! - 过滤条件（`Filter`）与可嵌套的逻辑分组（`FilterGroup`，AND/OR）；
//! - 排序（`Sort`）、分页（`Page`）、字段投影与关联包含；
//! - 可选聚合（`Aggregation`：group-by、having、统计项）。
//!
//! 同一规约既可通过 `is_satisfied_by` 在内存中对候选对象求值（用于缓存
//! 新鲜度校验与测试），也可通过 `to_query_params` 无损导出全部子句，
//! 由存储实现翻译为查询。两种语义必须一致。
//!
//! 组合规则：
//! - `and` 合并两侧的过滤条件列表；
//! - `or` 将两侧既有条件折叠进一个显式 OR 分组，绝不丢弃条件。
//!
mod builder;
mod eval;
mod filter;
mod query_params;

pub use builder::{GroupBuilder, SpecificationBuilder};
pub use eval::{compare_by_sorts, compare_values, field_value};
pub use filter::{
    Aggregation, Filter, FilterGroup, FilterOperator, LogicalOperator, Page, Sort, SortDirection,
    Stat, StatFunc,
};
pub use query_params::QueryParams;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 组合规约：一次查询的全部声明式条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeSpecification {
    pub(crate) filters: Vec<Filter>,
    pub(crate) groups: Vec<FilterGroup>,
    pub(crate) sorts: Vec<Sort>,
    pub(crate) page: Option<Page>,
    pub(crate) fields: Vec<String>,
    pub(crate) includes: Vec<String>,
    pub(crate) aggregation: Option<Aggregation>,
}

impl CompositeSpecification {
    /// 创建流式构建器
    pub fn builder() -> SpecificationBuilder {
        SpecificationBuilder::default()
    }

    /// 空规约（匹配一切）
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    pub fn sorts(&self) -> &[Sort] {
        &self.sorts
    }

    pub fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn aggregation(&self) -> Option<&Aggregation> {
        self.aggregation.as_ref()
    }

    /// 是否不含任何过滤条件（分组与顶层均为空）
    pub fn has_no_criteria(&self) -> bool {
        self.filters.is_empty() && self.groups.is_empty()
    }

    /// AND 组合：合并两侧的过滤条件与分组；排序拼接，分页以左侧优先
    pub fn and(mut self, other: CompositeSpecification) -> CompositeSpecification {
        self.filters.extend(other.filters);
        self.groups.extend(other.groups);
        self.sorts.extend(other.sorts);
        if self.page.is_none() {
            self.page = other.page;
        }
        self.fields.extend(other.fields);
        self.includes.extend(other.includes);
        if self.aggregation.is_none() {
            self.aggregation = other.aggregation;
        }
        self
    }

    /// OR 组合：将两侧既有条件各自折叠为 AND 子分组，再放入一个 OR 分组。
    /// 任一侧为空规约时直接返回另一侧，避免产生恒真子分组。
    pub fn or(self, other: CompositeSpecification) -> CompositeSpecification {
        if self.has_no_criteria() {
            return other;
        }
        if other.has_no_criteria() {
            return self;
        }

        let left = FilterGroup::conjunction(self.filters, self.groups);
        let right = FilterGroup::conjunction(other.filters, other.groups);

        let mut sorts = self.sorts;
        sorts.extend(other.sorts);
        let mut fields = self.fields;
        fields.extend(other.fields);
        let mut includes = self.includes;
        includes.extend(other.includes);

        CompositeSpecification {
            filters: Vec::new(),
            groups: vec![FilterGroup {
                operator: LogicalOperator::Or,
                filters: Vec::new(),
                groups: vec![left, right],
            }],
            sorts,
            page: self.page.or(other.page),
            fields,
            includes,
            aggregation: self.aggregation.or(other.aggregation),
        }
    }

    /// 内存求值：候选对象（序列化形态）是否满足全部条件。
    /// 排序/分页/投影不参与判定。
    pub fn is_satisfied_by(&self, candidate: &Value) -> bool {
        self.filters.iter().all(|f| f.is_satisfied_by(candidate))
            && self.groups.iter().all(|g| g.is_satisfied_by(candidate))
    }

    /// 无损导出全部子句，供存储实现翻译为查询
    pub fn to_query_params(&self) -> QueryParams {
        QueryParams {
            filters: self.filters.clone(),
            groups: self.groups.clone(),
            sorts: self.sorts.clone(),
            page: self.page.clone(),
            fields: self.fields.clone(),
            includes: self.includes.clone(),
            aggregation: self.aggregation.clone(),
        }
    }

    /// 规范化缓存键：查询参数的确定性 JSON 编码。
    /// 结构体字段顺序固定、列表保持构建顺序，因此同一规约总产生同一键。
    pub fn cache_key(&self) -> String {
        serde_json::to_string(&self.to_query_params())
            .unwrap_or_else(|_| "<unencodable-spec>".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_status_eq(status: &str) -> CompositeSpecification {
        CompositeSpecification::builder()
            .eq("status", status)
            .build()
    }

    #[test]
    fn and_merges_all_filters() {
        let a = CompositeSpecification::builder()
            .eq("status", "active")
            .gt("age", 18)
            .build();
        let b = CompositeSpecification::builder()
            .contains("name", "li")
            .build();

        let merged = a.and(b);
        assert_eq!(merged.filters().len(), 3);
        assert!(merged.groups().is_empty());

        assert!(merged.is_satisfied_by(&json!({
            "status": "active", "age": 30, "name": "alice"
        })));
        assert!(!merged.is_satisfied_by(&json!({
            "status": "active", "age": 30, "name": "bob"
        })));
    }

    #[test]
    fn or_folds_both_sides_into_single_group() {
        let merged = spec_status_eq("active").or(spec_status_eq("pending"));

        assert!(merged.filters().is_empty());
        assert_eq!(merged.groups().len(), 1);
        let group = &merged.groups()[0];
        assert_eq!(group.operator, LogicalOperator::Or);
        assert_eq!(group.groups.len(), 2);

        assert!(merged.is_satisfied_by(&json!({"status": "active"})));
        assert!(merged.is_satisfied_by(&json!({"status": "pending"})));
        assert!(!merged.is_satisfied_by(&json!({"status": "closed"})));
    }

    #[test]
    fn or_with_empty_side_keeps_other_unchanged() {
        let merged = CompositeSpecification::all().or(spec_status_eq("active"));
        assert_eq!(merged.filters().len(), 1);
        assert!(merged.groups().is_empty());
    }

    #[test]
    fn or_of_and_compositions_loses_nothing() {
        // (status=active AND age>18) OR (status=vip AND age>60)
        let a = CompositeSpecification::builder()
            .eq("status", "active")
            .gt("age", 18)
            .build();
        let b = CompositeSpecification::builder()
            .eq("status", "vip")
            .gt("age", 60)
            .build();
        let merged = a.or(b);

        assert!(merged.is_satisfied_by(&json!({"status": "active", "age": 19})));
        assert!(merged.is_satisfied_by(&json!({"status": "vip", "age": 61})));
        assert!(!merged.is_satisfied_by(&json!({"status": "vip", "age": 30})));
        assert!(!merged.is_satisfied_by(&json!({"status": "active", "age": 10})));
    }

    #[test]
    fn query_params_reproduce_every_clause() {
        let spec = CompositeSpecification::builder()
            .eq("status", "active")
            .between("age", 18, 65)
            .group(LogicalOperator::Or, |g| {
                g.eq("tier", "gold").eq("tier", "silver")
            })
            .sort_desc("created_at")
            .page(2, 50)
            .fields(["id", "name"])
            .include("orders")
            .build();

        let params = spec.to_query_params();
        assert_eq!(params.filters, spec.filters().to_vec());
        assert_eq!(params.groups, spec.groups().to_vec());
        assert_eq!(params.sorts, spec.sorts().to_vec());
        assert_eq!(params.page.as_ref(), spec.page());
        assert_eq!(params.fields, spec.fields().to_vec());
        assert_eq!(params.includes, spec.includes().to_vec());
    }

    #[test]
    fn cache_key_is_deterministic_and_criteria_sensitive() {
        let a = spec_status_eq("active");
        let b = spec_status_eq("active");
        let c = spec_status_eq("pending");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }
}
