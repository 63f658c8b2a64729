use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Exists,
    Matches,
}

/// A single predicate over a dotted field path. Paths traverse `input`,
/// `state`, and `previous.<step_id>...` segments of the evaluation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }
}

/// A condition or a condition-group. Groups combine with `all` / `any`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpr {
    All { all: Vec<ConditionExpr> },
    Any { any: Vec<ConditionExpr> },
    Leaf(Condition),
}

impl From<Condition> for ConditionExpr {
    fn from(cond: Condition) -> Self {
        ConditionExpr::Leaf(cond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expr_deserializes_leaf_and_groups() {
        let leaf: ConditionExpr =
            serde_json::from_value(json!({"field": "state.status", "op": "eq", "value": "ready"}))
                .unwrap();
        assert!(matches!(leaf, ConditionExpr::Leaf(_)));

        let group: ConditionExpr = serde_json::from_value(json!({
            "any": [
                {"field": "input.kind", "op": "eq", "value": "a"},
                {"all": [{"field": "state.n", "op": "gte", "value": 3}]}
            ]
        }))
        .unwrap();
        match group {
            ConditionExpr::Any { any } => assert_eq!(any.len(), 2),
            other => panic!("expected any-group, got {other:?}"),
        }
    }
}
