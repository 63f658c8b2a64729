use regex::Regex;
use serde_json::Value;

use tether_types::{Condition, ConditionExpr, ConditionOp};

/// Resolve a dotted path against a JSON context. Segments may carry a
/// bracket suffix (`previous[fetch_step].output`); numeric brackets index
/// arrays.
pub fn resolve_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = ctx;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        let (name, brackets) = split_brackets(segment);
        if !name.is_empty() {
            cursor = cursor.get(name)?;
        }
        for key in brackets {
            cursor = match key.parse::<usize>() {
                Ok(index) => cursor.get(index)?,
                Err(_) => cursor.get(key)?,
            };
        }
    }
    Some(cursor)
}

fn split_brackets(segment: &str) -> (&str, Vec<&str>) {
    let Some(open) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let name = &segment[..open];
    let mut keys = Vec::new();
    let mut rest = &segment[open..];
    while let Some(start) = rest.find('[') {
        let Some(end) = rest.find(']') else { break };
        if end > start {
            keys.push(&rest[start + 1..end]);
        }
        rest = &rest[end + 1..];
    }
    (name, keys)
}

/// Evaluate one predicate. Missing fields fail closed: only `exists` with an
/// expected `false` passes when the path does not resolve.
pub fn eval_condition(cond: &Condition, ctx: &Value) -> bool {
    let resolved = resolve_path(ctx, &cond.field);

    if cond.op == ConditionOp::Exists {
        let wants_existence = !matches!(cond.value, Value::Bool(false));
        return resolved.is_some() == wants_existence;
    }

    let Some(actual) = resolved else {
        return false;
    };

    match cond.op {
        ConditionOp::Eq => values_equal(actual, &cond.value),
        ConditionOp::Neq => !values_equal(actual, &cond.value),
        ConditionOp::Gt => compare(actual, &cond.value).is_some_and(|o| o.is_gt()),
        ConditionOp::Lt => compare(actual, &cond.value).is_some_and(|o| o.is_lt()),
        ConditionOp::Gte => compare(actual, &cond.value).is_some_and(|o| o.is_ge()),
        ConditionOp::Lte => compare(actual, &cond.value).is_some_and(|o| o.is_le()),
        ConditionOp::Contains => contains(actual, &cond.value),
        ConditionOp::Matches => regex_matches(actual, &cond.value),
        ConditionOp::Exists => unreachable!("handled above"),
    }
}

pub fn eval_expr(expr: &ConditionExpr, ctx: &Value) -> bool {
    match expr {
        ConditionExpr::All { all } => all.iter().all(|e| eval_expr(e, ctx)),
        ConditionExpr::Any { any } => any.iter().any(|e| eval_expr(e, ctx)),
        ConditionExpr::Leaf(cond) => eval_condition(cond, ctx),
    }
}

/// Numeric equality tolerates integer/float representation differences.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => expected
            .as_str()
            .is_some_and(|needle| haystack.contains(needle)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn regex_matches(actual: &Value, pattern: &Value) -> bool {
    let (Some(text), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return false;
    };
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Whether any leaf of the expression reads a volatile field. Used to keep
/// such policies out of the verdict cache.
pub fn references_volatile_field(expr: &ConditionExpr) -> bool {
    match expr {
        ConditionExpr::All { all } => all.iter().any(references_volatile_field),
        ConditionExpr::Any { any } => any.iter().any(references_volatile_field),
        ConditionExpr::Leaf(cond) => {
            cond.field == "timestamp"
                || cond.field.starts_with("timestamp.")
                || cond.field.starts_with("data.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_types::ConditionOp;

    fn ctx() -> Value {
        json!({
            "request": {"action": "send_sms", "zone": "yellow"},
            "state": {"status": "ready", "count": 3},
            "previous": {"fetch": {"output": {"items": [1, 2, 3]}}},
            "data": {"email": "a@b.co"}
        })
    }

    #[test]
    fn paths_traverse_nested_and_bracketed_segments() {
        let ctx = ctx();
        assert_eq!(
            resolve_path(&ctx, "state.status"),
            Some(&json!("ready"))
        );
        assert_eq!(
            resolve_path(&ctx, "previous[fetch].output.items[1]"),
            Some(&json!(2))
        );
        assert!(resolve_path(&ctx, "state.missing").is_none());
    }

    #[test]
    fn operators_behave_per_contract() {
        let ctx = ctx();
        let check = |field: &str, op, value| eval_condition(&Condition::new(field, op, value), &ctx);

        assert!(check("state.status", ConditionOp::Eq, json!("ready")));
        assert!(check("state.count", ConditionOp::Gte, json!(3)));
        assert!(check("state.count", ConditionOp::Lt, json!(3.5)));
        assert!(check("request.action", ConditionOp::Contains, json!("sms")));
        assert!(check(
            "previous[fetch].output.items",
            ConditionOp::Contains,
            json!(2)
        ));
        assert!(check("data.email", ConditionOp::Matches, json!("^[^@]+@[^@]+$")));
        assert!(check("data.email", ConditionOp::Exists, json!(true)));
        assert!(check("data.phone", ConditionOp::Exists, json!(false)));
        // missing fields fail closed
        assert!(!check("data.phone", ConditionOp::Eq, json!("x")));
    }

    #[test]
    fn groups_combine_all_and_any() {
        let ctx = ctx();
        let expr: ConditionExpr = serde_json::from_value(json!({
            "all": [
                {"field": "state.status", "op": "eq", "value": "ready"},
                {"any": [
                    {"field": "state.count", "op": "gt", "value": 10},
                    {"field": "request.zone", "op": "eq", "value": "yellow"}
                ]}
            ]
        }))
        .unwrap();
        assert!(eval_expr(&expr, &ctx));
    }

    #[test]
    fn volatile_detection_sees_nested_leaves() {
        let volatile: ConditionExpr = serde_json::from_value(json!({
            "any": [{"field": "data.flag", "op": "eq", "value": true}]
        }))
        .unwrap();
        assert!(references_volatile_field(&volatile));

        let stable: ConditionExpr = serde_json::from_value(
            json!({"field": "request.action", "op": "eq", "value": "x"}),
        )
        .unwrap();
        assert!(!references_volatile_field(&stable));
    }
}
