//! 规约的流式构建器
//!
//! 逐步累积过滤/分组/排序/分页/投影/聚合子句，`build()` 产出不可变的
//! `CompositeSpecification`。
//!
use super::CompositeSpecification;
use super::filter::{
    Aggregation, Filter, FilterGroup, FilterOperator, LogicalOperator, Page, Sort, SortDirection,
    Stat, StatFunc,
};
use serde_json::{Value, json};

/// 组合规约构建器
#[derive(Debug, Default)]
pub struct SpecificationBuilder {
    spec: CompositeSpecification,
}

impl SpecificationBuilder {
    // --- 过滤条件 ---

    pub fn filter(mut self, filter: Filter) -> Self {
        self.spec.filters.push(filter);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Eq, value.into())
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Ne, value.into())
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Gt, value.into())
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Gte, value.into())
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Lt, value.into())
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Lte, value.into())
    }

    /// 闭区间 `[lo, hi]`
    pub fn between(
        self,
        field: impl Into<String>,
        lo: impl Into<Value>,
        hi: impl Into<Value>,
    ) -> Self {
        self.push(field, FilterOperator::Between, json!([lo.into(), hi.into()]))
    }

    pub fn in_list(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.push(field, FilterOperator::In, Value::Array(values))
    }

    pub fn not_in(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.push(field, FilterOperator::NotIn, Value::Array(values))
    }

    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.push(field, FilterOperator::IsNull, Value::Null)
    }

    pub fn is_not_null(self, field: impl Into<String>) -> Self {
        self.push(field, FilterOperator::IsNotNull, Value::Null)
    }

    pub fn contains(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Contains, value.into())
    }

    pub fn starts_with(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(field, FilterOperator::StartsWith, Value::String(value.into()))
    }

    pub fn ends_with(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(field, FilterOperator::EndsWith, Value::String(value.into()))
    }

    /// 追加一个嵌套分组
    pub fn group(
        mut self,
        operator: LogicalOperator,
        f: impl FnOnce(GroupBuilder) -> GroupBuilder,
    ) -> Self {
        let group = f(GroupBuilder::new(operator)).build();
        self.spec.groups.push(group);
        self
    }

    // --- 排序 / 分页 / 投影 ---

    pub fn sort_asc(mut self, field: impl Into<String>) -> Self {
        self.spec.sorts.push(Sort {
            field: field.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    pub fn sort_desc(mut self, field: impl Into<String>) -> Self {
        self.spec.sorts.push(Sort {
            field: field.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    /// 分页（页码从 1 开始）
    pub fn page(mut self, number: u64, size: u64) -> Self {
        self.spec.page = Some(Page::new(number, size));
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.spec.includes.push(relation.into());
        self
    }

    // --- 聚合 ---

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.aggregation_mut().group_by.push(field.into());
        self
    }

    pub fn having(mut self, filter: Filter) -> Self {
        self.aggregation_mut().having.push(filter);
        self
    }

    pub fn stat(mut self, func: StatFunc, field: impl Into<String>) -> Self {
        self.aggregation_mut().stats.push(Stat {
            func,
            field: field.into(),
        });
        self
    }

    pub fn build(self) -> CompositeSpecification {
        self.spec
    }

    fn push(mut self, field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        self.spec.filters.push(Filter::new(field, operator, value));
        self
    }

    fn aggregation_mut(&mut self) -> &mut Aggregation {
        self.spec.aggregation.get_or_insert_with(|| Aggregation {
            group_by: Vec::new(),
            having: Vec::new(),
            stats: Vec::new(),
        })
    }
}

/// 嵌套分组构建器（支持再嵌套）
#[derive(Debug)]
pub struct GroupBuilder {
    group: FilterGroup,
}

impl GroupBuilder {
    fn new(operator: LogicalOperator) -> Self {
        Self {
            group: FilterGroup::new(operator),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.group.filters.push(filter);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Eq, value.into())
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Ne, value.into())
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Gt, value.into())
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Gte, value.into())
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Lt, value.into())
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Lte, value.into())
    }

    pub fn between(
        self,
        field: impl Into<String>,
        lo: impl Into<Value>,
        hi: impl Into<Value>,
    ) -> Self {
        self.push(field, FilterOperator::Between, json!([lo.into(), hi.into()]))
    }

    pub fn contains(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOperator::Contains, value.into())
    }

    /// 在分组内再嵌套一个子分组
    pub fn group(
        mut self,
        operator: LogicalOperator,
        f: impl FnOnce(GroupBuilder) -> GroupBuilder,
    ) -> Self {
        let nested = f(GroupBuilder::new(operator)).build();
        self.group.groups.push(nested);
        self
    }

    fn push(mut self, field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        self.group.filters.push(Filter::new(field, operator, value));
        self
    }

    fn build(self) -> FilterGroup {
        self.group
    }
}
