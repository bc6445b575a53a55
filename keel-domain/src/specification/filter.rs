//! 过滤条件、分组、排序、分页与聚合的基础值类型
//!
use super::eval;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 过滤操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// 闭区间，value 为 `[lo, hi]`
    Between,
    /// value 为候选值数组
    In,
    NotIn,
    IsNull,
    IsNotNull,
    /// 字符串子串或数组成员
    Contains,
    StartsWith,
    EndsWith,
}

/// 单个过滤条件（字段、操作符、比较值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// 内存求值：候选对象（序列化形态）的 `field` 是否满足该条件
    pub fn is_satisfied_by(&self, candidate: &Value) -> bool {
        eval::eval_filter(self, candidate)
    }
}

/// 分组的逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// 可嵌套的过滤分组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub operator: LogicalOperator,
    pub filters: Vec<Filter>,
    pub groups: Vec<FilterGroup>,
}

impl FilterGroup {
    pub fn new(operator: LogicalOperator) -> Self {
        Self {
            operator,
            filters: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// 将一组顶层条件折叠为一个 AND 分组（用于 OR 组合时的无损折叠）
    pub fn conjunction(filters: Vec<Filter>, groups: Vec<FilterGroup>) -> Self {
        Self {
            operator: LogicalOperator::And,
            filters,
            groups,
        }
    }

    fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.groups.is_empty()
    }

    /// 内存求值。空分组视为恒真（中性元素）。
    pub fn is_satisfied_by(&self, candidate: &Value) -> bool {
        if self.is_empty() {
            return true;
        }
        let filters = self.filters.iter().map(|f| f.is_satisfied_by(candidate));
        let groups = self.groups.iter().map(|g| g.is_satisfied_by(candidate));
        match self.operator {
            LogicalOperator::And => filters.chain(groups).all(|ok| ok),
            LogicalOperator::Or => filters.chain(groups).any(|ok| ok),
        }
    }
}

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// 排序键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

/// 分页参数（页码从 1 开始）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub number: u64,
    pub size: u64,
}

impl Page {
    pub fn new(number: u64, size: u64) -> Self {
        Self {
            number: number.max(1),
            size,
        }
    }

    /// 跳过的行数
    pub fn offset(&self) -> u64 {
        (self.number - 1) * self.size
    }
}

/// 统计函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// 单个统计项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub func: StatFunc,
    pub field: String,
}

/// 聚合子句：group-by 字段、having 过滤与统计项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub group_by: Vec<String>,
    pub having: Vec<Filter>,
    pub stats: Vec<Stat>,
}
