//! 条件评估器
//!
//! 实现各种操作符的评估逻辑，支持多种数据类型的比较。
//! 网络编译时预先构建正则表达式，匹配阶段走 `regex_match` 快速路径。

use crate::error::EvalError;
use crate::operators::Operator;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::Value;

type EvalResult<T> = std::result::Result<T, EvalError>;

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `field_value` - 从文档中获取的字段值
    /// * `operator` - 操作符
    /// * `expected_value` - 规则中的字面量，或 join 时前序文档中的值
    pub fn evaluate(
        field_value: Option<&Value>,
        operator: Operator,
        expected_value: &Value,
    ) -> EvalResult<bool> {
        match operator {
            Operator::IsEmpty => return Ok(Self::is_empty(field_value)),
            Operator::IsNotEmpty => return Ok(!Self::is_empty(field_value)),
            _ => {}
        }

        // 字段不存在时，其余操作一律不匹配
        let Some(field_value) = field_value else {
            return Ok(false);
        };

        match operator {
            Operator::Eq => Ok(Self::eq(field_value, expected_value)),
            Operator::Neq => Ok(!Self::eq(field_value, expected_value)),
            Operator::Gt => Self::compare(field_value, expected_value, |a, b| a > b),
            Operator::Gte => Self::compare(field_value, expected_value, |a, b| a >= b),
            Operator::Lt => Self::compare(field_value, expected_value, |a, b| a < b),
            Operator::Lte => Self::compare(field_value, expected_value, |a, b| a <= b),
            Operator::Between => Self::between(field_value, expected_value),
            Operator::In => Self::in_list(field_value, expected_value),
            Operator::NotIn => Self::in_list(field_value, expected_value).map(|r| !r),
            Operator::Contains => Self::contains(field_value, expected_value),
            Operator::ContainsAny => Self::contains_any(field_value, expected_value),
            Operator::ContainsAll => Self::contains_all(field_value, expected_value),
            Operator::StartsWith => {
                Ok(Self::expect_str(field_value)?.starts_with(Self::expect_str(expected_value)?))
            }
            Operator::EndsWith => {
                Ok(Self::expect_str(field_value)?.ends_with(Self::expect_str(expected_value)?))
            }
            Operator::Regex => {
                let pattern = Self::expect_str(expected_value)?;
                let regex = Regex::new(pattern).map_err(|e| {
                    EvalError::InvalidOperand(format!("无效的正则表达式 '{}': {}", pattern, e))
                })?;
                Self::regex_match(Some(field_value), &regex)
            }
            Operator::Before => Self::time_compare(field_value, expected_value, |a, b| a < b),
            Operator::After => Self::time_compare(field_value, expected_value, |a, b| a > b),
            Operator::IsEmpty | Operator::IsNotEmpty => Ok(false),
        }
    }

    /// 使用预编译的正则表达式匹配
    pub fn regex_match(field_value: Option<&Value>, regex: &Regex) -> EvalResult<bool> {
        match field_value {
            Some(v) => Ok(regex.is_match(Self::expect_str(v)?)),
            None => Ok(false),
        }
    }

    /// 判断值是否为空
    fn is_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(obj)) => obj.is_empty(),
            _ => false,
        }
    }

    /// 相等比较
    ///
    /// 数值统一转为浮点数比较，保证 100 == 100.0。
    fn eq(field: &Value, expected: &Value) -> bool {
        if !field.is_number() && !expected.is_number() {
            return field == expected;
        }

        match (Self::as_f64(field), Self::as_f64(expected)) {
            (Some(f1), Some(f2)) => (f1 - f2).abs() < f64::EPSILON,
            _ => field == expected,
        }
    }

    /// 数值比较
    fn compare<F>(field: &Value, expected: &Value, cmp: F) -> EvalResult<bool>
    where
        F: Fn(f64, f64) -> bool,
    {
        Ok(cmp(Self::expect_number(field)?, Self::expect_number(expected)?))
    }

    /// 范围比较 (between)，expected 为 [min, max]
    fn between(field: &Value, expected: &Value) -> EvalResult<bool> {
        let arr = Self::expect_array(expected)?;
        let [min, max] = arr.as_slice() else {
            return Err(EvalError::InvalidOperand(
                "between 操作符需要 [min, max] 数组".to_string(),
            ));
        };

        let value = Self::expect_number(field)?;
        Ok(value >= Self::expect_number(min)? && value <= Self::expect_number(max)?)
    }

    /// 列表包含检查 (in)
    fn in_list(field: &Value, expected: &Value) -> EvalResult<bool> {
        Ok(Self::expect_array(expected)?
            .iter()
            .any(|item| Self::eq(field, item)))
    }

    /// 字符串/数组包含检查
    fn contains(field: &Value, expected: &Value) -> EvalResult<bool> {
        match field {
            Value::String(s) => Ok(s.contains(Self::expect_str(expected)?)),
            Value::Array(arr) => Ok(arr.iter().any(|item| Self::eq(item, expected))),
            _ => Err(Self::mismatch("string or array", field)),
        }
    }

    /// 数组包含任意一个 (contains_any)
    fn contains_any(field: &Value, expected: &Value) -> EvalResult<bool> {
        let field_arr = Self::expect_array(field)?;
        Ok(Self::expect_array(expected)?
            .iter()
            .any(|e| field_arr.iter().any(|f| Self::eq(f, e))))
    }

    /// 数组包含全部 (contains_all)
    fn contains_all(field: &Value, expected: &Value) -> EvalResult<bool> {
        let field_arr = Self::expect_array(field)?;
        Ok(Self::expect_array(expected)?
            .iter()
            .all(|e| field_arr.iter().any(|f| Self::eq(f, e))))
    }

    /// 时间比较
    fn time_compare<F>(field: &Value, expected: &Value, cmp: F) -> EvalResult<bool>
    where
        F: Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
    {
        Ok(cmp(
            Self::parse_datetime(field)?,
            Self::parse_datetime(expected)?,
        ))
    }

    /// 解析日期时间：RFC 3339 或纯日期
    fn parse_datetime(value: &Value) -> EvalResult<DateTime<Utc>> {
        let s = Self::expect_str(value)?;

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }

        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .ok_or_else(|| EvalError::InvalidOperand(format!("无法解析日期时间: '{}'", s)))
    }

    fn expect_number(value: &Value) -> EvalResult<f64> {
        Self::as_f64(value).ok_or_else(|| Self::mismatch("number", value))
    }

    fn expect_str(value: &Value) -> EvalResult<&str> {
        value.as_str().ok_or_else(|| Self::mismatch("string", value))
    }

    fn expect_array(value: &Value) -> EvalResult<&Vec<Value>> {
        value.as_array().ok_or_else(|| Self::mismatch("array", value))
    }

    fn mismatch(expected: &str, actual: &Value) -> EvalError {
        EvalError::TypeMismatch {
            expected: expected.to_string(),
            actual: Self::type_name(actual).to_string(),
        }
    }

    /// 尝试将 Value 转换为 f64（数字字符串也接受）
    fn as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// 获取值的类型名称
    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(field: Value, op: Operator, expected: Value) -> bool {
        ConditionEvaluator::evaluate(Some(&field), op, &expected).unwrap()
    }

    #[test]
    fn test_eq_numbers() {
        assert!(eval(json!(100), Operator::Eq, json!(100)));
        assert!(eval(json!(100.0), Operator::Eq, json!(100)));
        assert!(eval(json!("100"), Operator::Eq, json!(100)));
        assert!(!eval(json!(101), Operator::Eq, json!(100)));
    }

    #[test]
    fn test_eq_strings() {
        assert!(eval(json!("hello"), Operator::Eq, json!("hello")));
        assert!(!eval(json!("hello"), Operator::Eq, json!("world")));
        // 两个字符串按原文比较，不做数值归一化
        assert!(!eval(json!("1.0"), Operator::Eq, json!("1")));
    }

    #[test]
    fn test_eq_objects() {
        assert!(eval(json!({"a": 1}), Operator::Eq, json!({"a": 1})));
        assert!(eval(json!({"a": 1}), Operator::Neq, json!({"a": 2})));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval(json!(100), Operator::Gt, json!(50)));
        assert!(eval(json!(100), Operator::Gte, json!(100)));
        assert!(eval(json!(50), Operator::Lt, json!(100)));
        assert!(eval(json!(100), Operator::Lte, json!(100)));
    }

    #[test]
    fn test_numeric_comparison_type_mismatch() {
        let result = ConditionEvaluator::evaluate(Some(&json!(true)), Operator::Gt, &json!(1));
        assert!(matches!(result, Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_between() {
        assert!(eval(json!(50), Operator::Between, json!([0, 100])));
        assert!(!eval(json!(150), Operator::Between, json!([0, 100])));
        assert!(ConditionEvaluator::evaluate(Some(&json!(5)), Operator::Between, &json!([1])).is_err());
    }

    #[test]
    fn test_in_list() {
        assert!(eval(json!("a"), Operator::In, json!(["a", "b", "c"])));
        assert!(!eval(json!("d"), Operator::In, json!(["a", "b", "c"])));
        assert!(eval(json!("d"), Operator::NotIn, json!(["a", "b", "c"])));
    }

    #[test]
    fn test_contains() {
        assert!(eval(json!("hello world"), Operator::Contains, json!("world")));
        assert!(eval(json!(["a", "b", "c"]), Operator::Contains, json!("b")));
    }

    #[test]
    fn test_contains_any_and_all() {
        assert!(eval(json!(["a", "b", "c"]), Operator::ContainsAny, json!(["b", "d"])));
        assert!(!eval(json!(["a", "b", "c"]), Operator::ContainsAny, json!(["x", "y"])));
        assert!(eval(json!(["a", "b", "c"]), Operator::ContainsAll, json!(["a", "b"])));
        assert!(!eval(json!(["a", "b", "c"]), Operator::ContainsAll, json!(["a", "d"])));
    }

    #[test]
    fn test_string_prefix_suffix() {
        assert!(eval(json!("hello world"), Operator::StartsWith, json!("hello")));
        assert!(eval(json!("hello world"), Operator::EndsWith, json!("world")));
    }

    #[test]
    fn test_regex() {
        assert!(eval(
            json!("user@example.com"),
            Operator::Regex,
            json!(r"^[\w.-]+@[\w.-]+\.\w+$")
        ));

        let regex = Regex::new("^dev[0-9]+$").unwrap();
        assert!(ConditionEvaluator::regex_match(Some(&json!("dev42")), &regex).unwrap());
        assert!(!ConditionEvaluator::regex_match(None, &regex).unwrap());
    }

    #[test]
    fn test_is_empty() {
        assert!(ConditionEvaluator::evaluate(None, Operator::IsEmpty, &json!(null)).unwrap());
        assert!(eval(json!(null), Operator::IsEmpty, json!(null)));
        assert!(eval(json!(""), Operator::IsEmpty, json!(null)));
        assert!(eval(json!([]), Operator::IsEmpty, json!(null)));
        assert!(!eval(json!("hello"), Operator::IsEmpty, json!(null)));
        assert!(eval(json!(0), Operator::IsNotEmpty, json!(null)));
    }

    #[test]
    fn test_time_comparison() {
        assert!(eval(
            json!("2024-01-15T10:00:00Z"),
            Operator::Before,
            json!("2024-01-20T10:00:00Z")
        ));
        assert!(eval(
            json!("2024-01-20"),
            Operator::After,
            json!("2024-01-15T10:00:00Z")
        ));
    }

    #[test]
    fn test_missing_field() {
        assert!(!ConditionEvaluator::evaluate(None, Operator::Eq, &json!("test")).unwrap());
    }
}
