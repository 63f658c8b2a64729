use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn, Level};
use uuid::Uuid;

use tether_compliance::{AuditEntry, AuditSink, ComplianceContext, ComplianceFramework};
use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_policy::{PolicyAction, PolicyContext, PolicyEngine, QualityContext, QualityGateExecutor};
use tether_state::{PutOptions, StateStore};
use tether_types::{
    codes, AgentSpec, CoreError, CoreResult, MessageRole, Run, RunError, RunLimits, RunMessage,
    RunStatus, RuntimeEvent, StepKind, TaskContext, ToolCallRecord, Zone,
};

use crate::approvals::ApprovalManager;
use crate::cancellation::CancellationRegistry;
use crate::catalog::TaskCatalog;
use crate::collaborators::{ModelRouter, SubAgentSpawner, ToolOutcome, ToolsCollaborator};
use crate::event_bus::EventBus;
use crate::router::{TaskRouter, TaskRouting};
use crate::steps::{apply_state_updates, InputRegistry, StepContext, StepDeps, StepExecutor};

/// A hard bound on graph traversal per run, over and above per-loop
/// `max_iterations`. A graph that walks more nodes than this is runaway.
const MAX_STEPS_PER_RUN: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub environment: String,
    pub default_actor: String,
    pub policy_checks_enabled: bool,
    pub compliance_checks_enabled: bool,
    /// Gate-policy name applied to the final output on completion.
    pub quality_gate: Option<String>,
    pub default_limits: RunLimits,
    pub auto_save_interval_ms: u64,
    pub run_retention_hours: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            default_actor: "system".to_string(),
            policy_checks_enabled: true,
            compliance_checks_enabled: false,
            quality_gate: None,
            default_limits: RunLimits::default(),
            auto_save_interval_ms: 30_000,
            run_retention_hours: 24,
        }
    }
}

/// Owns run lifecycles and ties the subsystems together: routing, step
/// execution, policy and compliance checks, approvals, quality gates,
/// persistence, and the auto-save loop.
pub struct RunOrchestrator {
    config: OrchestratorConfig,
    state: Arc<StateStore>,
    policy: Arc<PolicyEngine>,
    compliance: Arc<ComplianceFramework>,
    approvals: Arc<ApprovalManager>,
    tools: Arc<dyn ToolsCollaborator>,
    audit: Arc<dyn AuditSink>,
    events: EventBus,
    cancellations: CancellationRegistry,
    router: TaskRouter,
    executor: StepExecutor,
    quality: Arc<QualityGateExecutor>,
    runs: Arc<RwLock<HashMap<String, Run>>>,
    /// Synchronous shadow of each run's state, readable from polling waits.
    state_mirror: Arc<std::sync::RwLock<HashMap<String, Map<String, Value>>>>,
    autosave: Mutex<Option<(tokio::task::JoinHandle<()>, watch::Sender<bool>)>>,
}

impl RunOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        catalog: TaskCatalog,
        state: Arc<StateStore>,
        policy: Arc<PolicyEngine>,
        quality: Arc<QualityGateExecutor>,
        compliance: Arc<ComplianceFramework>,
        approvals: Arc<ApprovalManager>,
        models: Arc<dyn ModelRouter>,
        tools: Arc<dyn ToolsCollaborator>,
        audit: Arc<dyn AuditSink>,
        events: EventBus,
    ) -> Self {
        let executor = StepExecutor::new(Arc::new(StepDeps {
            models,
            tools: tools.clone(),
            approvals: approvals.clone(),
            policy: policy.clone(),
            quality: quality.clone(),
            events: events.clone(),
            inputs: InputRegistry::default(),
            sub_agents: RwLock::new(None),
        }));

        Self {
            config,
            state,
            policy,
            compliance,
            approvals,
            tools,
            audit,
            events,
            cancellations: CancellationRegistry::new(),
            router: TaskRouter::new(catalog),
            executor,
            quality,
            runs: Arc::new(RwLock::new(HashMap::new())),
            state_mirror: Arc::new(std::sync::RwLock::new(HashMap::new())),
            autosave: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    /// Register this orchestrator as the sub-agent spawner for its own step
    /// executor.
    pub async fn enable_sub_agents(self: Arc<Self>) {
        let spawner: Arc<dyn SubAgentSpawner> = self.clone();
        self.executor.set_sub_agent_spawner(spawner).await;
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    pub async fn create_run(
        &self,
        agent: AgentSpec,
        zone: Zone,
        task: Option<TaskContext>,
    ) -> CoreResult<Run> {
        let mut run = Run::new(agent, zone, task);
        run.limits = self.config.default_limits.clone();

        let system_prompt = run
            .agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| format!("You are the `{}` agent.", run.agent.name));
        run.messages
            .push(RunMessage::new(MessageRole::System, system_prompt));

        self.persist_run(&run).await?;
        self.state_mirror
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run.id.clone(), run.state.clone());
        self.runs.write().await.insert(run.id.clone(), run.clone());

        self.log_audit(
            AuditEntry::new("run.create", &self.config.default_actor, &run.id, true)
                .with_zone(zone),
        );
        self.events.publish(RuntimeEvent::new(
            "run_created",
            json!({"run_id": run.id, "zone": zone.as_str(), "agent": run.agent.name}),
        ));
        Ok(run)
    }

    /// Transition to running and drive the step graph to a terminal state.
    pub async fn start_run(&self, run_id: &str) -> CoreResult<Run> {
        let (zone, task) = {
            let runs = self.runs.read().await;
            let run = runs
                .get(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            (run.zone, run.task.clone())
        };

        if self.config.policy_checks_enabled {
            let ctx = PolicyContext::new("start_run", run_id, zone)
                .with_actor(self.config.default_actor.clone());
            let report = self.policy.evaluate(&ctx);
            if report.overall_action == PolicyAction::Deny {
                let message = format!(
                    "policy denied start_run for `{run_id}` ({} critical failures)",
                    report.critical_failures.len()
                );
                self.fail_run(run_id, RunError::new(codes::POLICY_DENIED, &message))
                    .await?;
                return Err(CoreError::PolicyDenied(message));
            }
        }

        self.transition(run_id, RunStatus::Running).await?;
        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(run_id) {
                if run.started_at.is_none() {
                    run.started_at = Some(Utc::now());
                }
            }
        }
        self.cancellations.create(run_id).await;
        self.events.publish(RuntimeEvent::new(
            "run_started",
            json!({"run_id": run_id}),
        ));
        emit_event(
            Level::INFO,
            ProcessKind::Runtime,
            ObservabilityEvent {
                event: "run.started",
                component: "orchestrator",
                run_id: Some(run_id),
                step_id: None,
                actor: Some(&self.config.default_actor),
                zone: Some(zone.as_str()),
                status: Some("running"),
                error_code: None,
                detail: None,
            },
        );

        if let Some(task) = task {
            self.drive(run_id, &task).await?;
        }
        self.load_run(run_id)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("run `{run_id}` vanished")))
    }

    async fn drive(&self, run_id: &str, task: &TaskContext) -> CoreResult<()> {
        let zone = match self.runs.read().await.get(run_id) {
            Some(run) => run.zone,
            None => return Err(CoreError::Validation(format!("unknown run `{run_id}`"))),
        };
        let routing = match self.router.route(&task.task_class, Some(&task.mode), zone) {
            Ok(routing) => routing,
            Err(err) => {
                self.fail_run(run_id, RunError::new(err.code(), err.to_string()))
                    .await?;
                return Err(err);
            }
        };

        let cancel = match self.cancellations.get(run_id).await {
            Some(token) => token,
            None => self.cancellations.create(run_id).await,
        };

        let mut previous: Map<String, Value> = Map::new();
        let mut current = routing.entry_step.clone();
        let mut visited = 0usize;

        loop {
            if cancel.is_cancelled() {
                self.cancel_run(run_id).await?;
                return Ok(());
            }
            visited += 1;
            if visited > MAX_STEPS_PER_RUN {
                self.fail_run(
                    run_id,
                    RunError::new(
                        codes::STEP_FAILED,
                        format!("run exceeded {MAX_STEPS_PER_RUN} step executions"),
                    ),
                )
                .await?;
                return Ok(());
            }

            let Some(step) = routing.step(&current) else {
                self.fail_run(
                    run_id,
                    RunError::new(codes::STEP_FAILED, format!("step `{current}` not found")),
                )
                .await?;
                return Ok(());
            };

            let ctx = self.build_step_context(run_id, zone, task, &previous, &cancel).await?;
            let result = self.executor.execute(step, Some(&routing), &ctx).await;

            // apply the result under the run lock
            let cap_error = {
                let mut runs = self.runs.write().await;
                let Some(run) = runs.get_mut(run_id) else {
                    return Err(CoreError::Validation(format!("run `{run_id}` vanished")));
                };
                apply_state_updates(&mut run.state, &result.state_updates);
                if let Some(output) = &result.output {
                    previous.insert(step.id.clone(), output.clone());
                    if let Some(usage) = output.get("usage") {
                        run.usage.input_tokens +=
                            usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                        run.usage.output_tokens +=
                            usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                        run.usage.cost_usd +=
                            usage.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
                    }
                    if matches!(step.kind, StepKind::Completion { .. }) {
                        if let Some(text) = output.get("text").and_then(Value::as_str) {
                            let mut message = RunMessage::new(MessageRole::Assistant, text);
                            message.step_id = Some(step.id.clone());
                            run.messages.push(message);
                        }
                    }
                }
                run.usage.tool_calls += result.tool_calls;
                self.state_mirror
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(run_id.to_string(), run.state.clone());
                check_caps(run)
            };

            self.events.publish(RuntimeEvent::new(
                "step_completed",
                json!({
                    "run_id": run_id,
                    "step_id": step.id,
                    "success": result.success,
                    "duration_ms": result.duration_ms,
                }),
            ));
            self.persist_run_best_effort(run_id).await;

            if let Some(error) = cap_error {
                self.fail_run(run_id, error).await?;
                return Ok(());
            }

            if result
                .error
                .as_ref()
                .is_some_and(|e| e.code == codes::RUN_CANCELLED)
            {
                self.cancel_run(run_id).await?;
                return Ok(());
            }

            match self.router.next_step(&routing, &current, &result) {
                Some(next) => current = next,
                None => {
                    if result.success {
                        self.finish_run(run_id).await?;
                    } else {
                        let error = result.error.unwrap_or_else(|| {
                            tether_types::StepError::new(codes::STEP_FAILED, "step failed")
                        });
                        self.fail_run(run_id, RunError::new(error.code, error.message))
                            .await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn build_step_context(
        &self,
        run_id: &str,
        zone: Zone,
        task: &TaskContext,
        previous: &Map<String, Value>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> CoreResult<StepContext> {
        let runs = self.runs.read().await;
        let run = runs
            .get(run_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;

        let mut ctx = StepContext::new(run_id, zone, task.input.clone());
        ctx.state = run.state.clone();
        ctx.previous = previous.clone();
        ctx.cancel = cancel.clone();
        ctx.approval_token = run
            .state
            .get("approval_token")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mirror = self.state_mirror.clone();
        let input = task.input.clone();
        let previous_snapshot = previous.clone();
        let id = run_id.to_string();
        ctx.live_state = Some(Arc::new(move || {
            let state = mirror
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(&id)
                .cloned()
                .unwrap_or_default();
            json!({"state": state, "input": input, "previous": previous_snapshot})
        }));
        Ok(ctx)
    }

    async fn finish_run(&self, run_id: &str) -> CoreResult<Run> {
        let (final_output, run_snapshot) = {
            let runs = self.runs.read().await;
            let run = runs
                .get(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            let output = run
                .final_output()
                .map(str::to_string)
                .or_else(|| {
                    run.state
                        .get("output")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default();
            (output, run.clone())
        };

        if let Some(gate_name) = &self.config.quality_gate {
            if let Some(gate) = self.policy.gate_policy(gate_name) {
                let quality_ctx = QualityContext {
                    agent_id: run_snapshot.agent.id.clone(),
                    zone: run_snapshot.zone,
                    input: run_snapshot
                        .task
                        .as_ref()
                        .map(|t| t.input.clone())
                        .unwrap_or(Value::Null),
                    output: final_output.clone(),
                    metadata: json!({"cost_usd": run_snapshot.usage.cost_usd}),
                };
                let execution = self.quality.execute(&gate, &quality_ctx).await;
                if execution.blocked() {
                    return self
                        .fail_run(
                            run_id,
                            RunError::new(
                                codes::GATE_FAILED,
                                format!(
                                    "quality gate `{gate_name}` blocked completion: {}",
                                    execution.blocking_failures.join(", ")
                                ),
                            ),
                        )
                        .await;
                }
            }
        }

        self.complete_run(run_id).await
    }

    pub async fn complete_run(&self, run_id: &str) -> CoreResult<Run> {
        self.transition(run_id, RunStatus::Completed).await?;
        let run = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            run.ended_at = Some(Utc::now());
            run.clone()
        };
        self.persist_run(&run).await?;

        let duration_ms = run
            .ended_at
            .zip(run.started_at)
            .map(|(end, start)| (end - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.log_audit(
            AuditEntry::new("run.complete", &self.config.default_actor, run_id, true)
                .with_zone(run.zone)
                .with_duration(duration_ms)
                .with_metadata(json!({
                    "cost_usd": run.usage.cost_usd,
                    "total_tokens": run.usage.total_tokens(),
                    "tool_calls": run.usage.tool_calls,
                })),
        );
        self.events.publish(RuntimeEvent::new(
            "run_completed",
            json!({"run_id": run_id, "cost_usd": run.usage.cost_usd}),
        ));
        self.cancellations.remove(run_id).await;
        info!(run_id, cost_usd = run.usage.cost_usd, "run completed");
        Ok(run)
    }

    pub async fn pause_run(&self, run_id: &str) -> CoreResult<Run> {
        self.transition(run_id, RunStatus::Paused).await?;
        let run = self.snapshot(run_id).await?;
        self.persist_run(&run).await?;
        self.events.publish(RuntimeEvent::new(
            "run_paused",
            json!({"run_id": run_id}),
        ));
        Ok(run)
    }

    pub async fn fail_run(&self, run_id: &str, error: RunError) -> CoreResult<Run> {
        self.transition(run_id, RunStatus::Failed).await?;
        let run = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            run.ended_at = Some(Utc::now());
            run.error = Some(error.clone());
            run.clone()
        };
        self.persist_run(&run).await?;

        self.log_audit(
            AuditEntry::new("run.fail", &self.config.default_actor, run_id, false)
                .with_zone(run.zone)
                .with_metadata(json!({"code": error.code, "message": error.message})),
        );
        self.events.publish(RuntimeEvent::new(
            "run_failed",
            json!({"run_id": run_id, "code": error.code}),
        ));
        self.cancellations.remove(run_id).await;
        warn!(run_id, code = %error.code, "run failed");
        Ok(run)
    }

    pub async fn cancel_run(&self, run_id: &str) -> CoreResult<Run> {
        self.cancellations.cancel(run_id).await;
        // racing an external cancel is fine; the first transition wins
        if self.transition(run_id, RunStatus::Cancelled).await.is_err() {
            return self.snapshot(run_id).await;
        }
        let run = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            run.ended_at = Some(Utc::now());
            run.error = Some(RunError::new(codes::RUN_CANCELLED, "run was cancelled"));
            run.clone()
        };
        self.persist_run(&run).await?;

        self.log_audit(
            AuditEntry::new("run.cancel", &self.config.default_actor, run_id, true)
                .with_zone(run.zone),
        );
        self.events.publish(RuntimeEvent::new(
            "run_cancelled",
            json!({"run_id": run_id}),
        ));
        self.cancellations.remove(run_id).await;
        Ok(run)
    }

    pub async fn add_message(
        &self,
        run_id: &str,
        role: MessageRole,
        content: impl Into<String>,
    ) -> CoreResult<RunMessage> {
        let message = RunMessage::new(role, content);
        {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            if run.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "run `{run_id}` is terminal; no further messages"
                )));
            }
            run.messages.push(message.clone());
        }
        self.persist_run_best_effort(run_id).await;
        Ok(message)
    }

    /// Externally provide the value a `human_input` step is waiting for.
    pub async fn provide_input(&self, run_id: &str, step_id: &str, value: Value) -> bool {
        self.executor
            .deps()
            .inputs
            .provide(&format!("{run_id}:{step_id}"), value)
            .await
    }

    /// Write a key into a run's state. Webhook handlers use this to satisfy
    /// the conditions suspended `wait` steps poll on.
    pub async fn update_run_state(&self, run_id: &str, key: &str, value: Value) -> CoreResult<()> {
        {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            run.state.insert(key.to_string(), value.clone());
            self.state_mirror
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(run_id.to_string(), run.state.clone());
        }
        self.persist_run_best_effort(run_id).await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tool execution
    // -----------------------------------------------------------------

    pub async fn execute_tool(
        &self,
        run_id: &str,
        tool: &str,
        input: Value,
        approval_token: Option<&str>,
    ) -> CoreResult<ToolOutcome> {
        let zone = {
            let runs = self.runs.read().await;
            let run = runs
                .get(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            if run.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "run `{run_id}` is terminal; no further tool calls"
                )));
            }
            run.zone
        };

        let definition = self
            .tools
            .get(tool)
            .await
            .ok_or_else(|| CoreError::Validation(format!("unknown tool `{tool}`")))?;

        if self.config.compliance_checks_enabled {
            let mut ctx = ComplianceContext::new(self.config.default_actor.clone(), tool);
            ctx.data = input.clone();
            ctx.target.phone = input
                .get("phone")
                .or_else(|| input.get("to"))
                .and_then(Value::as_str)
                .map(str::to_string);
            ctx.target.email = input
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string);
            let report = self.compliance.check_all(&ctx, None);
            if !report.overall_allowed {
                let codes_list: Vec<String> =
                    report.violations().map(|v| v.code.clone()).collect();
                return Err(CoreError::PolicyDenied(format!(
                    "compliance denied `{tool}`: {}",
                    codes_list.join(", ")
                )));
            }
        }

        if definition.requires_approval || zone == Zone::Red {
            match approval_token {
                Some(token) => {
                    self.approvals.validate(token, tool, tool, zone, true).await?;
                }
                None => {
                    let (request, _) = self
                        .approvals
                        .request(tool, tool, zone, run_id, None)
                        .await;
                    self.events.publish(RuntimeEvent::new(
                        "approval_required",
                        json!({"run_id": run_id, "tool": tool, "request_id": request.id}),
                    ));
                    return Err(CoreError::ApprovalRequired {
                        operation: tool.to_string(),
                        resource: tool.to_string(),
                        zone,
                    });
                }
            }
        }

        let mut record = ToolCallRecord::new(tool, input.clone());
        record.approval_request_id = approval_token.map(str::to_string);
        let outcome = self.tools.execute(tool, input, zone).await?;

        let cap_error = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
            record.ended_at = Some(Utc::now());
            record.success = Some(outcome.success);
            record.output = outcome.output.clone();
            record.error = outcome.error.clone();
            run.tool_calls.push(record);
            run.usage.tool_calls += 1;

            let content = match &outcome.output {
                Some(output) => output.to_string(),
                None => outcome.error.clone().unwrap_or_default(),
            };
            let mut message = RunMessage::new(MessageRole::Tool, content);
            message.step_id = None;
            run.messages.push(message);
            check_caps(run)
        };
        self.persist_run_best_effort(run_id).await;

        self.log_audit(
            AuditEntry::new("tool.execute", &self.config.default_actor, tool, outcome.success)
                .with_zone(zone)
                .with_metadata(json!({"run_id": run_id})),
        );

        if let Some(error) = cap_error {
            self.fail_run(run_id, error.clone()).await?;
            return Err(CoreError::ResourceLimit(error.message));
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------
    // Queries & persistence
    // -----------------------------------------------------------------

    pub async fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub async fn load_run(&self, run_id: &str) -> CoreResult<Option<Run>> {
        if let Some(run) = self.runs.read().await.get(run_id) {
            return Ok(Some(run.clone()));
        }
        let Some(raw) = self
            .state
            .get(&run_key(run_id), &self.config.environment)
            .await
        else {
            return Ok(None);
        };
        let run: Run = serde_json::from_value(raw)
            .map_err(|e| CoreError::Integrity(format!("stored run `{run_id}` is corrupt: {e}")))?;
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(Some(run))
    }

    async fn snapshot(&self, run_id: &str) -> CoreResult<Run> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))
    }

    async fn transition(&self, run_id: &str, next: RunStatus) -> CoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown run `{run_id}`")))?;
        if !run.status.can_transition_to(next) {
            return Err(CoreError::Conflict(format!(
                "run `{run_id}` cannot move from {:?} to {next:?}",
                run.status
            )));
        }
        run.status = next;
        Ok(())
    }

    /// Critical persistence: terminal transitions and creation must land.
    async fn persist_run(&self, run: &Run) -> CoreResult<()> {
        let value = serde_json::to_value(run).map_err(|e| CoreError::Storage(e.to_string()))?;
        self.state
            .put(
                &run_key(&run.id),
                value,
                PutOptions::new(&self.config.environment, &self.config.default_actor),
            )
            .await?;
        Ok(())
    }

    /// Step-by-step persistence: a transient storage failure is logged and
    /// retried by the auto-save loop rather than failing the run.
    async fn persist_run_best_effort(&self, run_id: &str) {
        let run = match self.runs.read().await.get(run_id) {
            Some(run) => run.clone(),
            None => return,
        };
        if let Err(err) = self.persist_run(&run).await {
            warn!(run_id, error = %err, "run persistence deferred to auto-save");
        }
    }

    fn log_audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.log_action(entry) {
            warn!(error = %err, "audit sink failed");
        }
    }

    // -----------------------------------------------------------------
    // Auto-save & cleanup
    // -----------------------------------------------------------------

    /// Start the background flush of running runs. Explicit start/stop with
    /// a shutdown channel; idempotent.
    pub async fn start_autosave(&self) {
        let mut autosave = self.autosave.lock().await;
        if autosave.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let runs = self.runs.clone();
        let state = self.state.clone();
        let environment = self.config.environment.clone();
        let actor = self.config.default_actor.clone();
        let interval = std::time::Duration::from_millis(self.config.auto_save_interval_ms.max(10));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
                let snapshots: Vec<Run> = runs
                    .read()
                    .await
                    .values()
                    .filter(|r| r.status == RunStatus::Running)
                    .cloned()
                    .collect();
                for run in snapshots {
                    let value = match serde_json::to_value(&run) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(run_id = %run.id, error = %err, "auto-save serialization failed");
                            continue;
                        }
                    };
                    if let Err(err) = state
                        .put(&run_key(&run.id), value, PutOptions::new(&environment, &actor))
                        .await
                    {
                        warn!(run_id = %run.id, error = %err, "auto-save write failed; will retry");
                    }
                }
            }
        });
        *autosave = Some((handle, shutdown_tx));
    }

    pub async fn stop_autosave(&self) {
        if let Some((handle, shutdown)) = self.autosave.lock().await.take() {
            let _ = shutdown.send(true);
            let _ = handle.await;
        }
    }

    /// Evict terminal runs older than the retention window from memory and
    /// from the state store.
    pub async fn cleanup(&self) -> CoreResult<usize> {
        let cutoff = Utc::now() - Duration::hours(self.config.run_retention_hours);
        let expired: Vec<String> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| {
                run.status.is_terminal() && run.ended_at.is_some_and(|ended| ended < cutoff)
            })
            .map(|run| run.id.clone())
            .collect();

        for run_id in &expired {
            self.runs.write().await.remove(run_id);
            self.state_mirror
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(run_id);
            self.state
                .delete(&run_key(run_id), &self.config.environment, &self.config.default_actor)
                .await?;
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl SubAgentSpawner for RunOrchestrator {
    async fn spawn(
        &self,
        task_class: &str,
        mode: Option<&str>,
        input: Value,
        parent_run_id: &str,
        zone: Zone,
    ) -> CoreResult<Value> {
        let parent = self.snapshot(parent_run_id).await?;
        let routing: TaskRouting = self.router.route(task_class, mode, zone)?;

        let mut agent = parent.agent.clone();
        agent.id = Uuid::new_v4().to_string();
        let child = self
            .create_run(
                agent,
                zone,
                Some(TaskContext {
                    task_class: task_class.to_string(),
                    mode: routing.mode.clone(),
                    input,
                }),
            )
            .await?;

        {
            let mut runs = self.runs.write().await;
            if let Some(child_run) = runs.get_mut(&child.id) {
                child_run.parent_run_id = Some(parent_run_id.to_string());
            }
            if let Some(parent_run) = runs.get_mut(parent_run_id) {
                parent_run.child_run_ids.push(child.id.clone());
            }
        }

        let finished = self.start_run(&child.id).await?;
        match finished.status {
            RunStatus::Completed => Ok(finished
                .final_output()
                .map(|text| Value::String(text.to_string()))
                .or_else(|| finished.state.get("output").cloned())
                .unwrap_or(Value::Null)),
            _ => Err(CoreError::GateFailed(format!(
                "sub-agent run `{}` ended {:?}",
                finished.id, finished.status
            ))),
        }
    }
}

fn run_key(run_id: &str) -> String {
    format!("run:{run_id}")
}


fn check_caps(run: &Run) -> Option<RunError> {
    if let Some(max_cost) = run.limits.max_cost_usd {
        if run.usage.cost_usd >= max_cost {
            return Some(RunError::new(
                codes::COST_LIMIT,
                format!(
                    "cumulative cost {:.4} reached the {max_cost:.4} cap",
                    run.usage.cost_usd
                ),
            ));
        }
    }
    if let Some(max_tokens) = run.limits.max_tokens {
        if run.usage.total_tokens() >= max_tokens {
            return Some(RunError::new(
                codes::TOKEN_LIMIT,
                format!(
                    "cumulative tokens {} reached the {max_tokens} cap",
                    run.usage.total_tokens()
                ),
            ));
        }
    }
    if let Some(max_calls) = run.limits.max_tool_calls {
        if run.usage.tool_calls >= max_calls {
            return Some(RunError::new(
                codes::TOOL_CALL_LIMIT,
                format!(
                    "{} tool calls reached the {max_calls} cap",
                    run.usage.tool_calls
                ),
            ));
        }
    }
    None
}
