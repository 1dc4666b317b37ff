//! Condition evaluation shared by branch nodes, `while` loops and step
//! preconditions.
//!
//! Evaluation never fails: a missing field, an unknown operator or an
//! unparseable expression all evaluate to `false`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use weft_core::context::ExecutionContext;

use crate::node::BranchSpec;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    In,
    NotEmpty,
}

impl Operator {
    /// Accepts both the symbolic and the spelled-out names.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "equals" | "eq" | "==" => Self::Equals,
            "not_equals" | "ne" | "!=" => Self::NotEquals,
            "contains" => Self::Contains,
            "greater_than" | "gt" | ">" => Self::GreaterThan,
            "less_than" | "lt" | "<" => Self::LessThan,
            "greater_or_equal" | "gte" | ">=" => Self::GreaterOrEqual,
            "less_or_equal" | "lte" | "<=" => Self::LessOrEqual,
            "in" => Self::In,
            "not_empty" => Self::NotEmpty,
            _ => return None,
        })
    }
}

/// Compare a context value against an expected value.
pub fn compare(actual: Option<&Value>, operator: &str, expected: &Value) -> bool {
    let Some(op) = Operator::parse(operator) else {
        return false;
    };
    let Some(actual) = actual else {
        return false;
    };
    match op {
        Operator::Equals => loose_eq(actual, expected),
        Operator::NotEquals => !loose_eq(actual, expected),
        Operator::Contains => match (actual, expected) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), _) => items.iter().any(|i| loose_eq(i, expected)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        Operator::GreaterThan => numeric(actual, expected).is_some_and(|(a, b)| a > b),
        Operator::LessThan => numeric(actual, expected).is_some_and(|(a, b)| a < b),
        Operator::GreaterOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a >= b),
        Operator::LessOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a <= b),
        Operator::In => match expected {
            Value::Array(items) => items.iter().any(|i| loose_eq(actual, i)),
            Value::String(haystack) => actual.as_str().is_some_and(|s| haystack.contains(s)),
            _ => false,
        },
        Operator::NotEmpty => is_truthy(actual),
    }
}

/// Evaluate a branch node's `{field, operator, value}` against the context.
pub fn evaluate_branch_spec(spec: &BranchSpec, context: &ExecutionContext) -> bool {
    compare(context.get(&spec.field), &spec.operator, &spec.value)
}

/// Evaluate a textual condition such as `review.status == "approved"`.
///
/// Clauses are `key OP value` (`==`, `!=`, `>`, `<`, `>=`, `<=`, `contains`,
/// `in`, `not_empty`), a bare key (truthiness) or `!key`, joined with `&&`
/// and `||` (`&&` binds tighter).
pub fn evaluate_condition(expr: &str, context: &ExecutionContext) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }
    expr.split("||").any(|any| {
        any.split("&&")
            .all(|clause| evaluate_clause(clause.trim(), context))
    })
}

fn clause_regex() -> Option<&'static Regex> {
    static CLAUSE: OnceLock<Option<Regex>> = OnceLock::new();
    CLAUSE
        .get_or_init(|| {
            Regex::new(
                r"^(?P<neg>!)?\s*(?P<key>[A-Za-z_][\w.\-]*)\s*(?:(?P<op>==|!=|>=|<=|>|<)|(?P<wop>contains|not_empty|in)\b)?\s*(?P<val>.*)$",
            )
            .ok()
        })
        .as_ref()
}

fn evaluate_clause(clause: &str, context: &ExecutionContext) -> bool {
    let Some(caps) = clause_regex().and_then(|re| re.captures(clause)) else {
        return false;
    };
    let negate = caps.name("neg").is_some();
    let key = caps.name("key").map(|m| m.as_str()).unwrap_or_default();
    let op = caps.name("op").or_else(|| caps.name("wop")).map(|m| m.as_str());
    let raw = caps.name("val").map(|m| m.as_str().trim()).unwrap_or_default();

    let result = match op {
        None if raw.is_empty() => context.get(key).is_some_and(is_truthy),
        None => return false,
        Some("not_empty") => compare(context.get(key), "not_empty", &Value::Null),
        Some(op) => compare(context.get(key), op, &parse_literal(raw)),
    };
    result != negate
}

/// Parse a literal from an expression: quoted strings, JSON, else raw text.
fn parse_literal(raw: &str) -> Value {
    let quoted = (raw.starts_with('"') && raw.ends_with('"'))
        || (raw.starts_with('\'') && raw.ends_with('\''));
    if quoted && raw.len() >= 2 {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Values are equal if identical or if their scalar text forms match.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (scalar_text(a), scalar_text(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((as_number(a)?, as_number(b)?))
}

pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        for (k, v) in pairs {
            ctx.publish(*k, v.clone(), "test").unwrap();
        }
        ctx
    }

    #[test]
    fn test_compare_operators() {
        let v = json!("approved");
        assert!(compare(Some(&v), "equals", &json!("approved")));
        assert!(compare(Some(&v), "not_equals", &json!("rejected")));
        assert!(compare(Some(&v), "contains", &json!("prov")));
        assert!(compare(Some(&json!(5)), "greater_than", &json!(3)));
        assert!(compare(Some(&json!("2")), "less_than", &json!(3)));
        assert!(compare(Some(&json!("b")), "in", &json!(["a", "b"])));
        assert!(compare(Some(&json!(["x", "y"])), "contains", &json!("y")));
        assert!(compare(Some(&json!([1])), "not_empty", &Value::Null));
        assert!(!compare(Some(&json!("")), "not_empty", &Value::Null));
    }

    #[test]
    fn test_missing_and_unknown_are_false() {
        assert!(!compare(None, "equals", &json!("x")));
        assert!(!compare(None, "not_equals", &json!("x")));
        assert!(!compare(Some(&json!("x")), "matches", &json!("x")));
    }

    #[test]
    fn test_loose_equality() {
        assert!(compare(Some(&json!("3")), "equals", &json!(3)));
        assert!(compare(Some(&json!(true)), "==", &json!("true")));
    }

    #[test]
    fn test_branch_spec_dotted_field() {
        let c = ctx(&[("review", json!({"status": "approved"}))]);
        let spec = BranchSpec::new("review.status", "equals", json!("approved"));
        assert!(evaluate_branch_spec(&spec, &c));
        let spec = BranchSpec::new("review.score", "equals", json!(1));
        assert!(!evaluate_branch_spec(&spec, &c));
    }

    #[test]
    fn test_expressions() {
        let c = ctx(&[
            ("status", json!("success")),
            ("count", json!(4)),
            ("notes", json!("all tests passed")),
            ("flag", json!(false)),
        ]);
        assert!(evaluate_condition(r#"status == "success""#, &c));
        assert!(!evaluate_condition(r#"status != "success""#, &c));
        assert!(evaluate_condition("count >= 4", &c));
        assert!(evaluate_condition("count < 10 && status == 'success'", &c));
        assert!(evaluate_condition(r#"notes contains "passed""#, &c));
        assert!(evaluate_condition(r#"status in ["success", "skipped"]"#, &c));
        assert!(evaluate_condition("notes not_empty", &c));
        assert!(evaluate_condition("status", &c));
        assert!(!evaluate_condition("flag", &c));
        assert!(evaluate_condition("!flag", &c));
        assert!(evaluate_condition("flag || count > 3", &c));
    }

    #[test]
    fn test_invalid_expressions() {
        let c = ExecutionContext::new();
        assert!(!evaluate_condition("", &c));
        assert!(!evaluate_condition("this is not valid", &c));
        assert!(!evaluate_condition(r#"missing == "value""#, &c));
    }
}
