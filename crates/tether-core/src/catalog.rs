use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tether_types::{CoreError, CoreResult, StepKind, StepNode, Zone};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeGraph {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entry_step: String,
    pub exit_step: String,
    pub steps: Vec<StepNode>,
}

impl ModeGraph {
    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Every referenced id must exist; entry and exit must exist. Cycles are
    /// allowed (loops and conditionals bound them).
    pub fn validate(&self) -> CoreResult<()> {
        let ids: std::collections::HashSet<&str> =
            self.steps.iter().map(|s| s.id.as_str()).collect();
        if !ids.contains(self.entry_step.as_str()) {
            return Err(CoreError::Validation(format!(
                "entry step `{}` does not exist in mode `{}`",
                self.entry_step, self.name
            )));
        }
        if !ids.contains(self.exit_step.as_str()) {
            return Err(CoreError::Validation(format!(
                "exit step `{}` does not exist in mode `{}`",
                self.exit_step, self.name
            )));
        }
        for step in &self.steps {
            for referenced in step.referenced_ids() {
                if !ids.contains(referenced) {
                    return Err(CoreError::Validation(format!(
                        "step `{}` references unknown step `{referenced}`",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn estimated_duration_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(|s| s.estimated_duration_ms.unwrap_or(0))
            .sum()
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        self.steps
            .iter()
            .map(|s| s.estimated_cost_usd.unwrap_or(0.0))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_class: String,
    pub description: String,
    pub default_mode: String,
    pub allowed_zones: Vec<Zone>,
    pub modes: Vec<ModeGraph>,
}

impl TaskDefinition {
    pub fn mode(&self, name: &str) -> Option<&ModeGraph> {
        self.modes.iter().find(|m| m.name == name)
    }
}

/// Declarative task catalog: task class -> modes -> step graphs.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: HashMap<String, TaskDefinition>,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in catalog shipped with the runtime.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(research_task());
        catalog.register(outreach_task());
        catalog.register(deploy_task());
        catalog
    }

    pub fn register(&mut self, task: TaskDefinition) {
        self.tasks.insert(task.task_class.clone(), task);
    }

    pub fn get(&self, task_class: &str) -> Option<&TaskDefinition> {
        self.tasks.get(task_class)
    }

    pub fn task_classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

fn research_task() -> TaskDefinition {
    let mut answer = StepNode::new(
        "answer",
        StepKind::Completion {
            prompt: None,
            preset: Some("research".to_string()),
            model: None,
            output_key: Some("output".to_string()),
        },
    );
    answer.estimated_duration_ms = Some(4_000);
    answer.estimated_cost_usd = Some(0.01);

    let mut plan = StepNode::new(
        "plan",
        StepKind::Completion {
            prompt: Some("Break the question into research sub-questions.".to_string()),
            preset: Some("research".to_string()),
            model: None,
            output_key: Some("plan".to_string()),
        },
    )
    .with_next("synthesize");
    plan.estimated_duration_ms = Some(5_000);
    plan.estimated_cost_usd = Some(0.02);

    let mut synthesize = StepNode::new(
        "synthesize",
        StepKind::Completion {
            prompt: Some("Synthesize the findings into a final answer.".to_string()),
            preset: Some("research".to_string()),
            model: None,
            output_key: Some("output".to_string()),
        },
    );
    synthesize.estimated_duration_ms = Some(8_000);
    synthesize.estimated_cost_usd = Some(0.04);

    TaskDefinition {
        task_class: "research".to_string(),
        description: "Answer a question, quickly or in depth".to_string(),
        default_mode: "quick".to_string(),
        allowed_zones: vec![Zone::Green, Zone::Yellow],
        modes: vec![
            ModeGraph {
                name: "quick".to_string(),
                description: Some("single-pass answer".to_string()),
                entry_step: "answer".to_string(),
                exit_step: "answer".to_string(),
                steps: vec![answer],
            },
            ModeGraph {
                name: "deep".to_string(),
                description: Some("plan, then synthesize".to_string()),
                entry_step: "plan".to_string(),
                exit_step: "synthesize".to_string(),
                steps: vec![plan, synthesize],
            },
        ],
    }
}

fn outreach_task() -> TaskDefinition {
    let compose = StepNode::new(
        "compose",
        StepKind::Completion {
            prompt: Some("Compose a short outreach message for the recipient.".to_string()),
            preset: None,
            model: None,
            output_key: Some("message".to_string()),
        },
    )
    .with_next("send");

    let mut send = StepNode::new(
        "send",
        StepKind::ToolCall {
            tool: "send_sms".to_string(),
            input: serde_json::json!({"body": "$state.message", "to": "$input.to"}),
            output_key: Some("delivery".to_string()),
        },
    );
    send.required_zone = Some(Zone::Yellow);
    send.retry = Some(tether_types::RetryPolicy {
        max_attempts: 3,
        backoff_ms: 500,
    });

    TaskDefinition {
        task_class: "outreach".to_string(),
        description: "Compose and send a message to a recipient".to_string(),
        default_mode: "sms".to_string(),
        allowed_zones: vec![Zone::Yellow, Zone::Red],
        modes: vec![ModeGraph {
            name: "sms".to_string(),
            description: None,
            entry_step: "compose".to_string(),
            exit_step: "send".to_string(),
            steps: vec![compose, send],
        }],
    }
}

fn deploy_task() -> TaskDefinition {
    let mut release = StepNode::new(
        "release",
        StepKind::ToolCall {
            tool: "deploy_production".to_string(),
            input: serde_json::json!({"target": "$input.target"}),
            output_key: Some("release".to_string()),
        },
    )
    .with_next("confirm");
    release.required_zone = Some(Zone::Red);
    release.timeout_ms = Some(120_000);

    let confirm = StepNode::new(
        "confirm",
        StepKind::Wait {
            duration_ms: None,
            until: Some(tether_types::Condition::new(
                "state.release.status",
                tether_types::ConditionOp::Eq,
                serde_json::json!("healthy"),
            )),
            poll_interval_ms: Some(2_000),
            poll_timeout_ms: Some(300_000),
            backoff: None,
        },
    );

    TaskDefinition {
        task_class: "deploy".to_string(),
        description: "Release to production and wait for health".to_string(),
        default_mode: "standard".to_string(),
        allowed_zones: vec![Zone::Red],
        modes: vec![ModeGraph {
            name: "standard".to_string(),
            description: None,
            entry_step: "release".to_string(),
            exit_step: "confirm".to_string(),
            steps: vec![release, confirm],
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_validates() {
        let catalog = TaskCatalog::builtin();
        assert_eq!(catalog.task_classes(), vec!["deploy", "outreach", "research"]);
        for class in catalog.task_classes() {
            let task = catalog.get(class).unwrap();
            assert!(task.mode(&task.default_mode).is_some());
            for mode in &task.modes {
                mode.validate().unwrap();
            }
        }
    }

    #[test]
    fn validation_catches_dangling_references() {
        let mode = ModeGraph {
            name: "broken".to_string(),
            description: None,
            entry_step: "a".to_string(),
            exit_step: "a".to_string(),
            steps: vec![StepNode::new(
                "a",
                StepKind::Conditional {
                    condition: tether_types::ConditionExpr::Leaf(tether_types::Condition::new(
                        "input.x",
                        tether_types::ConditionOp::Exists,
                        serde_json::json!(true),
                    )),
                    if_true: Some("missing".to_string()),
                    if_false: None,
                },
            )],
        };
        assert!(matches!(mode.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn estimates_sum_over_steps() {
        let catalog = TaskCatalog::builtin();
        let research = catalog.get("research").unwrap();
        let deep = research.mode("deep").unwrap();
        assert_eq!(deep.estimated_duration_ms(), 13_000);
        assert!((deep.estimated_cost_usd() - 0.06).abs() < 1e-9);
    }
}
