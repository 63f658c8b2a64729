use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use tether_types::{CoreError, CoreResult};
use tether_webhooks::{WebhookEvent, WebhookHandler};

use crate::orchestrator::RunOrchestrator;

/// Bridges verified webhook events into suspended runs. An event that names
/// a `run_id` can either answer a `human_input` step (`step_id` + `input`)
/// or write a state key a polling `wait` step is watching
/// (`state_key` + `value`).
pub struct RunSignalHandler {
    orchestrator: Arc<RunOrchestrator>,
}

impl RunSignalHandler {
    pub fn new(orchestrator: Arc<RunOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl WebhookHandler for RunSignalHandler {
    fn name(&self) -> &str {
        "run-signal"
    }

    async fn handle(&self, event: &WebhookEvent) -> CoreResult<()> {
        let Some(run_id) = event.payload.get("run_id").and_then(Value::as_str) else {
            debug!(provider = %event.provider, "webhook event names no run; ignoring");
            return Ok(());
        };

        if let Some(step_id) = event.payload.get("step_id").and_then(Value::as_str) {
            let input = event.payload.get("input").cloned().unwrap_or(Value::Null);
            if !self.orchestrator.provide_input(run_id, step_id, input).await {
                return Err(CoreError::Validation(format!(
                    "run `{run_id}` has no step `{step_id}` waiting for input"
                )));
            }
            return Ok(());
        }

        if let Some(state_key) = event.payload.get("state_key").and_then(Value::as_str) {
            let value = event.payload.get("value").cloned().unwrap_or(Value::Null);
            return self
                .orchestrator
                .update_run_state(run_id, state_key, value)
                .await;
        }

        debug!(run_id, "webhook event carried neither step input nor state");
        Ok(())
    }
}
