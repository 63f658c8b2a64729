use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::{Condition, ConditionExpr};
use crate::run::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    #[default]
    All,
    Any,
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateOp {
    Set,
    Append,
    Increment,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Exponential backoff parameters for polling waits:
/// `interval(n) = min(initial_ms * multiplier^(n-1), max_ms)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

/// Step behavior, tagged by `type`. Each variant carries its own config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Completion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preset: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
    },
    HumanInput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_key: Option<String>,
    },
    Approval {
        operation: String,
        resource: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        justification: Option<String>,
    },
    Gate {
        policy: String,
    },
    StateUpdate {
        key: String,
        operation: StateOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_from: Option<String>,
    },
    SubAgent {
        task_class: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(default)]
        input: Value,
    },
    Conditional {
        condition: ConditionExpr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        if_true: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        if_false: Option<String>,
    },
    Parallel {
        children: Vec<String>,
        #[serde(default)]
        join: JoinPolicy,
    },
    Loop {
        body: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<ConditionExpr>,
        max_iterations: u32,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<Condition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff: Option<BackoffPolicy>,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Completion { .. } => "completion",
            StepKind::ToolCall { .. } => "tool_call",
            StepKind::HumanInput { .. } => "human_input",
            StepKind::Approval { .. } => "approval",
            StepKind::Gate { .. } => "gate",
            StepKind::StateUpdate { .. } => "state_update",
            StepKind::SubAgent { .. } => "sub_agent",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Loop { .. } => "loop",
            StepKind::Wait { .. } => "wait",
        }
    }
}

/// A node in a task's execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_zone: Option<Zone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

impl StepNode {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            on_error: None,
            timeout_ms: None,
            retry: None,
            skip_if: None,
            required_zone: None,
            estimated_duration_ms: None,
            estimated_cost_usd: None,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Ids this node references; each must exist in the same mode's node set.
    pub fn referenced_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        if let Some(next) = &self.next {
            ids.push(next);
        }
        if let Some(on_error) = &self.on_error {
            ids.push(on_error);
        }
        match &self.kind {
            StepKind::Conditional {
                if_true, if_false, ..
            } => {
                if let Some(id) = if_true {
                    ids.push(id);
                }
                if let Some(id) = if_false {
                    ids.push(id);
                }
            }
            StepKind::Parallel { children, .. } => ids.extend(children.iter().map(String::as_str)),
            StepKind::Loop { body, .. } => ids.extend(body.iter().map(String::as_str)),
            _ => {}
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default)]
    pub state_updates: Map<String, Value>,
    /// Tool executions this step performed, including those inside
    /// parallel and loop bodies. Folded into the run's usage counters.
    #[serde(default)]
    pub tool_calls: u32,
}

impl StepResult {
    pub fn success(step_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            output: None,
            error: None,
            duration_ms,
            next_step: None,
            state_updates: Map::new(),
            tool_calls: 0,
        }
    }

    pub fn failure(step_id: impl Into<String>, error: StepError, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            output: None,
            error: Some(error),
            duration_ms,
            next_step: None,
            state_updates: Map::new(),
            tool_calls: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_node_round_trips_with_flattened_type_tag() {
        let raw = json!({
            "id": "check",
            "type": "conditional",
            "condition": {"field": "state.ok", "op": "eq", "value": true},
            "if_true": "done",
            "if_false": "retry",
            "on_error": "cleanup"
        });
        let node: StepNode = serde_json::from_value(raw).unwrap();
        assert_eq!(node.kind.type_name(), "conditional");
        let mut refs = node.referenced_ids();
        refs.sort_unstable();
        assert_eq!(refs, vec!["cleanup", "done", "retry"]);
    }

    #[test]
    fn parallel_children_are_referenced_ids() {
        let node = StepNode::new(
            "fan",
            StepKind::Parallel {
                children: vec!["a".into(), "b".into()],
                join: JoinPolicy::Majority,
            },
        )
        .with_next("join");
        let refs = node.referenced_ids();
        assert!(refs.contains(&"a") && refs.contains(&"b") && refs.contains(&"join"));
    }
}
