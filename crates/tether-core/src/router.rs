use serde::{Deserialize, Serialize};

use tether_types::{CoreError, CoreResult, StepNode, StepResult, Zone};

use crate::catalog::TaskCatalog;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRouting {
    pub task_class: String,
    pub mode: String,
    pub entry_step: String,
    pub exit_step: String,
    pub steps: Vec<StepNode>,
    pub estimated_duration_ms: u64,
    pub estimated_cost_usd: f64,
}

impl TaskRouting {
    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Resolves (task_class, mode, zone) into a validated step graph and picks
/// successor steps during execution.
pub struct TaskRouter {
    catalog: TaskCatalog,
}

impl TaskRouter {
    pub fn new(catalog: TaskCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn route(
        &self,
        task_class: &str,
        mode: Option<&str>,
        zone: Zone,
    ) -> CoreResult<TaskRouting> {
        let task = self.catalog.get(task_class).ok_or_else(|| {
            CoreError::Validation(format!("unknown task class `{task_class}`"))
        })?;

        if !task.allowed_zones.contains(&zone) {
            return Err(CoreError::PolicyDenied(format!(
                "task `{task_class}` is not allowed in the {zone} zone"
            )));
        }

        let mode_name = mode.unwrap_or(task.default_mode.as_str());
        let graph = task.mode(mode_name).ok_or_else(|| {
            CoreError::Validation(format!(
                "task `{task_class}` has no mode `{mode_name}`"
            ))
        })?;
        graph.validate()?;

        Ok(TaskRouting {
            task_class: task.task_class.clone(),
            mode: graph.name.clone(),
            entry_step: graph.entry_step.clone(),
            exit_step: graph.exit_step.clone(),
            steps: graph.steps.clone(),
            estimated_duration_ms: graph.estimated_duration_ms(),
            estimated_cost_usd: graph.estimated_cost_usd(),
        })
    }

    /// Successor selection: an explicit `next_step` on the result wins, then
    /// the node's `next`. Failures route through `on_error` or terminate.
    /// Reaching the exit step terminates.
    pub fn next_step(
        &self,
        routing: &TaskRouting,
        current_step_id: &str,
        result: &StepResult,
    ) -> Option<String> {
        let current = routing.step(current_step_id)?;

        if !result.success {
            return current.on_error.clone();
        }
        if current_step_id == routing.exit_step {
            return None;
        }
        result.next_step.clone().or_else(|| current.next.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::StepError;

    fn router() -> TaskRouter {
        TaskRouter::new(TaskCatalog::builtin())
    }

    #[test]
    fn routing_resolves_default_mode_and_estimates() {
        let router = router();
        let routing = router.route("research", None, Zone::Green).unwrap();
        assert_eq!(routing.mode, "quick");
        assert_eq!(routing.entry_step, "answer");

        let deep = router.route("research", Some("deep"), Zone::Green).unwrap();
        assert_eq!(deep.steps.len(), 2);
        assert!(deep.estimated_cost_usd > 0.0);
    }

    #[test]
    fn unknown_task_and_mode_are_validation_errors() {
        let router = router();
        assert!(matches!(
            router.route("nonsense", None, Zone::Green),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            router.route("research", Some("nonsense"), Zone::Green),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn zone_restrictions_deny_routing() {
        let router = router();
        assert!(matches!(
            router.route("deploy", None, Zone::Green),
            Err(CoreError::PolicyDenied(_))
        ));
        assert!(router.route("deploy", None, Zone::Red).is_ok());
    }

    #[test]
    fn successor_selection_follows_the_contract() {
        let router = router();
        let routing = router.route("research", Some("deep"), Zone::Green).unwrap();

        // explicit next_step on the result wins
        let mut result = StepResult::success("plan", 10);
        result.next_step = Some("synthesize".to_string());
        assert_eq!(
            router.next_step(&routing, "plan", &result).as_deref(),
            Some("synthesize")
        );

        // node's own next otherwise
        let result = StepResult::success("plan", 10);
        assert_eq!(
            router.next_step(&routing, "plan", &result).as_deref(),
            Some("synthesize")
        );

        // exit step terminates
        let result = StepResult::success("synthesize", 10);
        assert_eq!(router.next_step(&routing, "synthesize", &result), None);

        // failure without on_error terminates
        let result = StepResult::failure(
            "plan",
            StepError::new("STEP_FAILED", "boom"),
            10,
        );
        assert_eq!(router.next_step(&routing, "plan", &result), None);
    }
}
