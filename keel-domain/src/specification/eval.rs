//! 规约的内存求值
//!
//! 对候选对象的序列化形态（`serde_json::Value`）进行字段解析与比较。
//! 该语义与存储实现的查询翻译必须保持一致（见集成测试）。
//!
use super::filter::{Filter, FilterOperator, Sort, SortDirection};
use serde_json::Value;
use std::cmp::Ordering;

/// 按点路径解析嵌套字段（`address.city`）
pub fn field_value<'a>(candidate: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = candidate;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// 跨类型比较：数值按 f64、字符串按字典序、布尔按 false < true。
/// 类型不一致或不可比较时返回 None（条件视为不满足）。
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn is_null(candidate: &Value, field: &str) -> bool {
    matches!(field_value(candidate, field), None | Some(Value::Null))
}

pub(crate) fn eval_filter(filter: &Filter, candidate: &Value) -> bool {
    match filter.operator {
        FilterOperator::IsNull => return is_null(candidate, &filter.field),
        FilterOperator::IsNotNull => return !is_null(candidate, &filter.field),
        _ => {}
    }

    let Some(actual) = field_value(candidate, &filter.field) else {
        return false;
    };

    match filter.operator {
        FilterOperator::Eq => compare_values(actual, &filter.value) == Some(Ordering::Equal),
        FilterOperator::Ne => match compare_values(actual, &filter.value) {
            Some(ord) => ord != Ordering::Equal,
            // 类型不同视为不相等
            None => true,
        },
        FilterOperator::Gt => compare_values(actual, &filter.value) == Some(Ordering::Greater),
        FilterOperator::Gte => matches!(
            compare_values(actual, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::Lt => compare_values(actual, &filter.value) == Some(Ordering::Less),
        FilterOperator::Lte => matches!(
            compare_values(actual, &filter.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::Between => {
            let Some(bounds) = filter.value.as_array() else {
                return false;
            };
            let (Some(lo), Some(hi)) = (bounds.first(), bounds.get(1)) else {
                return false;
            };
            matches!(
                compare_values(actual, lo),
                Some(Ordering::Greater | Ordering::Equal)
            ) && matches!(compare_values(actual, hi), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOperator::In => filter
            .value
            .as_array()
            .is_some_and(|vs| vs.iter().any(|v| compare_values(actual, v) == Some(Ordering::Equal))),
        FilterOperator::NotIn => filter
            .value
            .as_array()
            .is_some_and(|vs| vs.iter().all(|v| compare_values(actual, v) != Some(Ordering::Equal))),
        FilterOperator::Contains => match actual {
            Value::String(s) => filter.value.as_str().is_some_and(|sub| s.contains(sub)),
            Value::Array(items) => items
                .iter()
                .any(|item| compare_values(item, &filter.value) == Some(Ordering::Equal)),
            _ => false,
        },
        FilterOperator::StartsWith => match (actual, filter.value.as_str()) {
            (Value::String(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        },
        FilterOperator::EndsWith => match (actual, filter.value.as_str()) {
            (Value::String(s), Some(suffix)) => s.ends_with(suffix),
            _ => false,
        },
        FilterOperator::IsNull | FilterOperator::IsNotNull => unreachable!(),
    }
}

/// 依排序键比较两个候选对象（供内存存储实现复用）。
/// 缺失字段排在存在字段之前；全部排序键相等时返回 Equal。
pub fn compare_by_sorts(left: &Value, right: &Value, sorts: &[Sort]) -> Ordering {
    for sort in sorts {
        let lv = field_value(left, &sort.field);
        let rv = field_value(right, &sort.field);
        let ord = match (lv, rv) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
        };
        let ord = match sort.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
