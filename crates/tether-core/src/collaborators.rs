use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_types::{CoreResult, Zone};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub preset: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelCompletion {
    pub output: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Model-routing collaborator. Transport lives elsewhere; the core only
/// needs completions, cost estimates, and usage recording.
#[async_trait]
pub trait ModelRouter: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> CoreResult<ModelCompletion>;

    fn estimate_cost(&self, _request: &ModelRequest) -> f64 {
        0.0
    }

    fn record_usage(
        &self,
        _provider: &str,
        _model: &str,
        _input_tokens: u64,
        _output_tokens: u64,
        _latency_ms: u64,
        _success: bool,
    ) {
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tools-registry collaborator.
#[async_trait]
pub trait ToolsCollaborator: Send + Sync {
    async fn get(&self, name: &str) -> Option<ToolDefinition>;
    async fn execute(&self, name: &str, input: Value, zone: Zone) -> CoreResult<ToolOutcome>;
}

/// Spawns child runs for `sub_agent` steps. Implemented by the orchestrator
/// and injected into the step executor after construction.
#[async_trait]
pub trait SubAgentSpawner: Send + Sync {
    async fn spawn(
        &self,
        task_class: &str,
        mode: Option<&str>,
        input: Value,
        parent_run_id: &str,
        zone: Zone,
    ) -> CoreResult<Value>;
}
