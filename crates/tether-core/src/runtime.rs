use std::sync::Arc;

use tether_compliance::{AuditSink, ComplianceFramework, TracingAuditSink};
use tether_ledger::{FileIdempotencyStore, IdempotencyLedger};
use tether_policy::{PolicyEngine, PolicyEngineConfig, QualityGateConfig, QualityGateExecutor};
use tether_state::StateStore;
use tether_types::CoreResult;

use crate::approvals::{ApprovalConfig, ApprovalManager};
use crate::catalog::TaskCatalog;
use crate::collaborators::{ModelRouter, ToolsCollaborator};
use crate::config::RuntimeConfig;
use crate::event_bus::EventBus;
use crate::orchestrator::{OrchestratorConfig, RunOrchestrator};

/// The explicit dependency container: every component the runtime needs,
/// built once and threaded into the orchestrator on construction. Tests
/// swap collaborators by building their own container.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub state: Arc<StateStore>,
    pub ledger: Arc<IdempotencyLedger>,
    pub policy: Arc<PolicyEngine>,
    pub quality: Arc<QualityGateExecutor>,
    pub compliance: Arc<ComplianceFramework>,
    pub approvals: Arc<ApprovalManager>,
    pub events: EventBus,
    pub orchestrator: Arc<RunOrchestrator>,
}

impl Runtime {
    /// Wire the whole core from environment-driven configuration plus the
    /// externally provided collaborators.
    pub async fn bootstrap(
        config: RuntimeConfig,
        catalog: TaskCatalog,
        models: Arc<dyn ModelRouter>,
        tools: Arc<dyn ToolsCollaborator>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> CoreResult<Self> {
        let audit = audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let events = EventBus::new();

        let state = Arc::new(StateStore::open(config.state_root.join("state")).await?);
        let ledger_store =
            Arc::new(FileIdempotencyStore::open(config.state_root.join("idempotency")).await?);
        let ledger = Arc::new(IdempotencyLedger::new(ledger_store, config.ledger_config()));

        let policy = Arc::new(PolicyEngine::new(PolicyEngineConfig::default()));
        if let Some(dir) = &config.policy_dir {
            load_policy_dir(&policy, dir).await?;
        }
        let quality = Arc::new(QualityGateExecutor::new(QualityGateConfig::default()));
        let compliance = Arc::new(ComplianceFramework::new(audit.clone()));
        let approvals = Arc::new(ApprovalManager::new(
            ApprovalConfig {
                secret: config.approval_secret.clone(),
                token_ttl_seconds: config.approval_token_ttl_seconds as i64,
                ..ApprovalConfig::default()
            },
            events.clone(),
        ));

        let orchestrator = Arc::new(RunOrchestrator::new(
            OrchestratorConfig {
                environment: config.environment.clone(),
                default_actor: config.default_actor.clone(),
                policy_checks_enabled: config.policy_checks_enabled,
                default_limits: config.default_limits.clone(),
                auto_save_interval_ms: config.auto_save_interval_ms,
                run_retention_hours: config.run_retention_hours,
                ..OrchestratorConfig::default()
            },
            catalog,
            state.clone(),
            policy.clone(),
            quality.clone(),
            compliance.clone(),
            approvals.clone(),
            models,
            tools,
            audit,
            events.clone(),
        ));
        orchestrator.clone().enable_sub_agents().await;

        Ok(Self {
            config,
            state,
            ledger,
            policy,
            quality,
            compliance,
            approvals,
            events,
            orchestrator,
        })
    }

    pub async fn shutdown(&self) {
        self.orchestrator.stop_autosave().await;
    }
}

/// Register every `*.json` policy under the directory. A corrupt policy file
/// is skipped with a warning, never fatal to startup.
async fn load_policy_dir(
    engine: &PolicyEngine,
    dir: &std::path::Path,
) -> CoreResult<()> {
    use tether_types::CoreError;

    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(CoreError::Storage(err.to_string())),
    };
    while let Some(dirent) = read_dir
        .next_entry()
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?
    {
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable policy file");
                continue;
            }
        };
        match serde_json::from_str::<tether_policy::Policy>(&raw) {
            Ok(policy) => engine.register(policy),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "invalid policy file skipped");
            }
        }
    }
    Ok(())
}
