use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_policy::{eval_condition, eval_expr, resolve_path, PolicyEngine, QualityContext,
    QualityGateExecutor};
use tether_types::{
    codes, Condition, JoinPolicy, StateOp, StepError, StepKind, StepNode, StepResult, Zone,
};

use crate::approvals::ApprovalManager;
use crate::collaborators::{ChatMessage, ModelRequest, ModelRouter, SubAgentSpawner,
    ToolsCollaborator};
use crate::event_bus::EventBus;
use crate::router::TaskRouting;

const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;

fn zone_rank(zone: Zone) -> u8 {
    match zone {
        Zone::Green => 0,
        Zone::Yellow => 1,
        Zone::Red => 2,
    }
}

/// Waiters for externally supplied input (`human_input` steps), keyed by
/// `run_id:step_id`.
#[derive(Clone, Default)]
pub struct InputRegistry {
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<Value>>>>>,
}

impl InputRegistry {
    pub async fn register(&self, key: &str) -> watch::Receiver<Option<Value>> {
        let (tx, rx) = watch::channel(None);
        self.waiters.write().await.insert(key.to_string(), tx);
        rx
    }

    pub async fn provide(&self, key: &str, value: Value) -> bool {
        match self.waiters.read().await.get(key) {
            Some(tx) => tx.send(Some(value)).is_ok(),
            None => false,
        }
    }

    pub async fn remove(&self, key: &str) {
        self.waiters.write().await.remove(key);
    }
}

/// Everything step handlers may touch.
pub struct StepDeps {
    pub models: Arc<dyn ModelRouter>,
    pub tools: Arc<dyn ToolsCollaborator>,
    pub approvals: Arc<ApprovalManager>,
    pub policy: Arc<PolicyEngine>,
    pub quality: Arc<QualityGateExecutor>,
    pub events: EventBus,
    pub inputs: InputRegistry,
    pub sub_agents: RwLock<Option<Arc<dyn SubAgentSpawner>>>,
}

/// Immutable view of the run a step executes inside.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: String,
    pub zone: Zone,
    pub input: Value,
    pub state: Map<String, Value>,
    /// step_id -> that step's output
    pub previous: Map<String, Value>,
    pub approval_token: Option<String>,
    pub cancel: CancellationToken,
    /// Live snapshot provider for polling waits; falls back to the static
    /// context when absent.
    pub live_state: Option<Arc<dyn Fn() -> Value + Send + Sync>>,
}

impl StepContext {
    pub fn new(run_id: impl Into<String>, zone: Zone, input: Value) -> Self {
        Self {
            run_id: run_id.into(),
            zone,
            input,
            state: Map::new(),
            previous: Map::new(),
            approval_token: None,
            cancel: CancellationToken::new(),
            live_state: None,
        }
    }

    /// The JSON view conditions and `$` references resolve against.
    pub fn to_value(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "zone": self.zone.as_str(),
            "input": self.input,
            "state": self.state,
            "previous": self.previous,
        })
    }

    fn current_view(&self) -> Value {
        match &self.live_state {
            Some(live) => live(),
            None => self.to_value(),
        }
    }
}

struct HandlerOutcome {
    output: Option<Value>,
    next_step: Option<String>,
    state_updates: Map<String, Value>,
    tool_calls: u32,
}

impl HandlerOutcome {
    fn empty() -> Self {
        Self {
            output: None,
            next_step: None,
            state_updates: Map::new(),
            tool_calls: 0,
        }
    }

    fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            next_step: None,
            state_updates: Map::new(),
            tool_calls: 0,
        }
    }
}

/// Executes a single step: skip conditions, zone enforcement, handler
/// dispatch, a timeout race, and a retry loop with linear backoff.
pub struct StepExecutor {
    deps: Arc<StepDeps>,
}

impl StepExecutor {
    pub fn new(deps: Arc<StepDeps>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &Arc<StepDeps> {
        &self.deps
    }

    pub async fn set_sub_agent_spawner(&self, spawner: Arc<dyn SubAgentSpawner>) {
        *self.deps.sub_agents.write().await = Some(spawner);
    }

    pub fn execute<'a>(
        &'a self,
        step: &'a StepNode,
        routing: Option<&'a TaskRouting>,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let started = Instant::now();

            if let Some(skip_if) = &step.skip_if {
                if eval_condition(skip_if, &ctx.to_value()) {
                    let mut result =
                        StepResult::success(&step.id, started.elapsed().as_millis() as u64);
                    result.next_step = step.next.clone();
                    result.output = Some(json!({"skipped": true}));
                    return result;
                }
            }

            if let Some(required) = step.required_zone {
                if zone_rank(ctx.zone) < zone_rank(required) {
                    return StepResult::failure(
                        &step.id,
                        StepError::new(
                            codes::ZONE_MISMATCH,
                            format!(
                                "step `{}` requires the {required:?} zone but the run is {}",
                                step.id, ctx.zone
                            )
                            .to_lowercase(),
                        ),
                        started.elapsed().as_millis() as u64,
                    );
                }
            }

            let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS));
            let max_attempts = step.retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
            let backoff_ms = step.retry.map(|r| r.backoff_ms).unwrap_or(0);

            let mut last_error = StepError::new(codes::STEP_FAILED, "step did not run");
            for attempt in 1..=max_attempts {
                if ctx.cancel.is_cancelled() {
                    return StepResult::failure(
                        &step.id,
                        StepError::new(codes::RUN_CANCELLED, "run was cancelled"),
                        started.elapsed().as_millis() as u64,
                    );
                }

                // biased: a cancelled handler reports its own typed outcome
                // before the blanket cancellation arm can win the race
                let outcome = tokio::select! {
                    biased;
                    outcome = self.dispatch(step, routing, ctx) => Some(outcome),
                    _ = ctx.cancel.cancelled() => Some(Err(StepError::new(
                        codes::RUN_CANCELLED,
                        "run was cancelled",
                    ))),
                    _ = tokio::time::sleep(timeout) => None,
                };

                match outcome {
                    Some(Ok(handler)) => {
                        let mut result =
                            StepResult::success(&step.id, started.elapsed().as_millis() as u64);
                        result.output = handler.output;
                        result.next_step = handler.next_step;
                        result.state_updates = handler.state_updates;
                        result.tool_calls = handler.tool_calls;
                        return result;
                    }
                    Some(Err(error)) => {
                        let retryable = error.code != codes::RUN_CANCELLED
                            && error.code != codes::APPROVAL_REQUIRED
                            && error.code != codes::POLLING_CANCELLED;
                        last_error = error;
                        if !retryable {
                            break;
                        }
                    }
                    None => {
                        last_error = StepError::new(
                            codes::STEP_TIMEOUT,
                            format!("step `{}` timed out after {}ms", step.id, timeout.as_millis()),
                        );
                    }
                }

                if attempt < max_attempts {
                    debug!(step = %step.id, attempt, "retrying step after failure");
                    let delay = Duration::from_millis(backoff_ms * attempt as u64);
                    if !crate::polling::interruptible_sleep(delay, &ctx.cancel).await {
                        last_error = StepError::new(codes::RUN_CANCELLED, "run was cancelled");
                        break;
                    }
                }
            }

            StepResult::failure(&step.id, last_error, started.elapsed().as_millis() as u64)
        })
    }

    async fn dispatch(
        &self,
        step: &StepNode,
        routing: Option<&TaskRouting>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        match &step.kind {
            StepKind::Completion {
                prompt,
                preset,
                model,
                output_key,
            } => {
                self.run_completion(step, prompt.as_deref(), preset.clone(), model.clone(), output_key.as_deref(), ctx)
                    .await
            }
            StepKind::ToolCall {
                tool,
                input,
                output_key,
            } => self.run_tool_call(step, tool, input, output_key.as_deref(), ctx).await,
            StepKind::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let met = eval_expr(condition, &ctx.to_value());
                let mut outcome = HandlerOutcome::with_output(json!({"condition_met": met}));
                outcome.next_step = if met { if_true.clone() } else { if_false.clone() };
                Ok(outcome)
            }
            StepKind::StateUpdate {
                key,
                operation,
                value,
                value_from,
            } => self.run_state_update(key, *operation, value.as_ref(), value_from.as_deref(), ctx),
            StepKind::Wait {
                duration_ms,
                until,
                poll_interval_ms,
                poll_timeout_ms,
                backoff,
            } => {
                self.run_wait(
                    *duration_ms,
                    until.as_ref(),
                    *poll_interval_ms,
                    *poll_timeout_ms,
                    *backoff,
                    ctx,
                )
                .await
            }
            StepKind::Parallel { children, join } => {
                self.run_parallel(children, *join, routing, ctx).await
            }
            StepKind::Loop {
                body,
                until,
                max_iterations,
            } => self.run_loop(body, until.as_ref(), *max_iterations, routing, ctx).await,
            StepKind::HumanInput { prompt, input_key } => {
                self.run_human_input(step, prompt.as_deref(), input_key.as_deref(), ctx)
                    .await
            }
            StepKind::Approval {
                operation,
                resource,
                justification,
            } => {
                self.run_approval(step, operation, resource, justification.clone(), ctx)
                    .await
            }
            StepKind::Gate { policy } => self.run_gate(policy, ctx).await,
            StepKind::SubAgent {
                task_class,
                mode,
                input,
            } => {
                self.run_sub_agent(step, task_class, mode.as_deref(), input, ctx)
                    .await
            }
        }
    }

    async fn run_completion(
        &self,
        step: &StepNode,
        prompt: Option<&str>,
        preset: Option<String>,
        model: Option<String>,
        output_key: Option<&str>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let user_content = match prompt {
            Some(prompt) => prompt.to_string(),
            None => ctx
                .input
                .get("question")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| ctx.input.to_string()),
        };
        let request = ModelRequest {
            messages: vec![ChatMessage::new("user", user_content)],
            preset,
            provider: None,
            model,
        };

        let completion = self
            .deps
            .models
            .complete(request)
            .await
            .map_err(|err| StepError::new(err.code(), err.to_string()))?;
        self.deps.models.record_usage(
            &completion.provider,
            &completion.model,
            completion.input_tokens,
            completion.output_tokens,
            completion.latency_ms,
            true,
        );

        let key = output_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_output", step.id));
        let mut outcome = HandlerOutcome::with_output(json!({
            "text": completion.output,
            "usage": {
                "input_tokens": completion.input_tokens,
                "output_tokens": completion.output_tokens,
                "cost_usd": completion.cost_usd,
            },
        }));
        outcome
            .state_updates
            .insert(key, Value::String(completion.output));
        Ok(outcome)
    }

    async fn run_tool_call(
        &self,
        step: &StepNode,
        tool: &str,
        input: &Value,
        output_key: Option<&str>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let definition = self
            .deps
            .tools
            .get(tool)
            .await
            .ok_or_else(|| StepError::new(codes::STEP_FAILED, format!("unknown tool `{tool}`")))?;

        if definition.requires_approval || ctx.zone == Zone::Red {
            match &ctx.approval_token {
                Some(token) => {
                    self.deps
                        .approvals
                        .validate(token, tool, tool, ctx.zone, true)
                        .await
                        .map_err(|err| StepError::new(err.code(), err.to_string()))?;
                }
                None => {
                    let (request, _) = self
                        .deps
                        .approvals
                        .request(tool, tool, ctx.zone, &ctx.run_id, None)
                        .await;
                    return Err(StepError::new(
                        codes::APPROVAL_REQUIRED,
                        format!(
                            "tool `{tool}` needs an approval token (request `{}` is pending)",
                            request.id
                        ),
                    ));
                }
            }
        }

        let resolved_input = resolve_references(input, &ctx.to_value());
        let outcome = self
            .deps
            .tools
            .execute(tool, resolved_input, ctx.zone)
            .await
            .map_err(|err| StepError::new(err.code(), err.to_string()))?;

        if !outcome.success {
            return Err(StepError::new(
                codes::STEP_FAILED,
                outcome
                    .error
                    .unwrap_or_else(|| format!("tool `{tool}` failed")),
            ));
        }

        let output = outcome.output.unwrap_or(Value::Null);
        let mut handler = HandlerOutcome::with_output(output.clone());
        handler.tool_calls = 1;
        if let Some(key) = output_key {
            handler.state_updates.insert(key.to_string(), output);
        } else {
            handler
                .state_updates
                .insert(format!("{}_output", step.id), output);
        }
        Ok(handler)
    }

    fn run_state_update(
        &self,
        key: &str,
        operation: StateOp,
        value: Option<&Value>,
        value_from: Option<&str>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let resolved = match value_from {
            Some(path) => resolve_path(&ctx.to_value(), path).cloned(),
            None => value.cloned(),
        };

        let mut outcome = HandlerOutcome::empty();
        let updated = match operation {
            StateOp::Set => resolved.unwrap_or(Value::Null),
            StateOp::Append => {
                let mut items = match ctx.state.get(key) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                    None => Vec::new(),
                };
                items.push(resolved.unwrap_or(Value::Null));
                Value::Array(items)
            }
            StateOp::Increment => {
                let current = ctx.state.get(key).and_then(Value::as_f64).unwrap_or(0.0);
                let delta = resolved.as_ref().and_then(Value::as_f64).unwrap_or(1.0);
                json!(current + delta)
            }
            // a Null update is how the orchestrator spells key removal
            StateOp::Delete => Value::Null,
        };
        outcome.output = Some(json!({"key": key, "operation": operation}));
        outcome.state_updates.insert(key.to_string(), updated);
        Ok(outcome)
    }

    async fn run_wait(
        &self,
        duration_ms: Option<u64>,
        until: Option<&Condition>,
        poll_interval_ms: Option<u64>,
        poll_timeout_ms: Option<u64>,
        backoff: Option<tether_types::BackoffPolicy>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        if let Some(duration) = duration_ms {
            let finished = crate::polling::interruptible_sleep(
                Duration::from_millis(duration),
                &ctx.cancel,
            )
            .await;
            if !finished {
                return Err(StepError::new(
                    codes::POLLING_CANCELLED,
                    "wait cancelled during fixed delay",
                ));
            }
        }

        let Some(condition) = until else {
            return Ok(HandlerOutcome::with_output(json!({"waited_ms": duration_ms})));
        };

        let config = crate::polling::PollConfig {
            interval_ms: poll_interval_ms,
            timeout_ms: poll_timeout_ms,
            backoff,
            on_poll: None,
        };
        let condition = condition.clone();
        let result = crate::polling::poll_for_condition(
            || {
                let view = ctx.current_view();
                let condition = condition.clone();
                async move { Ok(eval_condition(&condition, &view)) }
            },
            &config,
            &ctx.cancel,
        )
        .await
        .map_err(|err| StepError::new(err.code(), err.to_string()))?;

        match result.metrics.outcome {
            crate::polling::PollOutcome::Success => Ok(HandlerOutcome::with_output(json!({
                "condition_met": true,
                "metrics": result.metrics,
            }))),
            crate::polling::PollOutcome::Timeout => Err(StepError::new(
                codes::POLLING_TIMEOUT,
                format!(
                    "condition not met after {} attempts",
                    result.metrics.attempts
                ),
            )),
            crate::polling::PollOutcome::Cancelled => Err(StepError::new(
                codes::POLLING_CANCELLED,
                "polling cancelled",
            )),
            crate::polling::PollOutcome::Error => Err(StepError::new(
                codes::STEP_FAILED,
                "poll condition errored",
            )),
        }
    }

    async fn run_parallel(
        &self,
        children: &[String],
        join: JoinPolicy,
        routing: Option<&TaskRouting>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let Some(routing) = routing else {
            return Err(StepError::new(
                codes::STEP_FAILED,
                "parallel step needs a routing graph",
            ));
        };

        let mut futures = Vec::with_capacity(children.len());
        for child_id in children {
            let Some(child) = routing.step(child_id) else {
                return Err(StepError::new(
                    codes::STEP_FAILED,
                    format!("parallel child `{child_id}` not found"),
                ));
            };
            futures.push(self.execute(child, Some(routing), ctx));
        }
        let results = join_all(futures).await;

        let successes = results.iter().filter(|r| r.success).count();
        let required = match join {
            JoinPolicy::All => children.len(),
            JoinPolicy::Any => 1,
            // ties round up
            JoinPolicy::Majority => children.len() / 2 + 1,
        };

        if successes < required {
            return Err(StepError::new(
                codes::STEP_FAILED,
                format!(
                    "parallel join `{join:?}` needs {required} successes, got {successes}"
                )
                .to_lowercase(),
            ));
        }

        // last-writer-wins merge keyed by state key
        let mut outcome = HandlerOutcome::empty();
        for result in &results {
            outcome.tool_calls += result.tool_calls;
            for (key, value) in &result.state_updates {
                outcome.state_updates.insert(key.clone(), value.clone());
            }
        }
        outcome.output = Some(json!({
            "children": results,
            "successes": successes,
        }));
        Ok(outcome)
    }

    async fn run_loop(
        &self,
        body: &[String],
        until: Option<&tether_types::ConditionExpr>,
        max_iterations: u32,
        routing: Option<&TaskRouting>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let Some(routing) = routing else {
            return Err(StepError::new(
                codes::STEP_FAILED,
                "loop step needs a routing graph",
            ));
        };

        let mut local = ctx.clone();
        let mut accumulated = Map::new();
        let mut iterations = 0u32;
        let mut tool_calls = 0u32;

        'outer: for _ in 0..max_iterations.max(1) {
            iterations += 1;
            for step_id in body {
                let Some(step) = routing.step(step_id) else {
                    return Err(StepError::new(
                        codes::STEP_FAILED,
                        format!("loop body step `{step_id}` not found"),
                    ));
                };
                let result = self.execute(step, Some(routing), &local).await;
                if !result.success {
                    let error = result
                        .error
                        .unwrap_or_else(|| StepError::new(codes::STEP_FAILED, "loop body failed"));
                    return Err(error);
                }
                tool_calls += result.tool_calls;
                apply_state_updates(&mut local.state, &result.state_updates);
                apply_state_updates(&mut accumulated, &result.state_updates);
                if let Some(output) = result.output {
                    local.previous.insert(step_id.clone(), output);
                }
            }
            if let Some(until) = until {
                if eval_expr(until, &local.to_value()) {
                    break 'outer;
                }
            }
        }

        let mut outcome = HandlerOutcome::with_output(json!({"iterations": iterations}));
        outcome.state_updates = accumulated;
        outcome.tool_calls = tool_calls;
        Ok(outcome)
    }

    async fn run_human_input(
        &self,
        step: &StepNode,
        prompt: Option<&str>,
        input_key: Option<&str>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let key = format!("{}:{}", ctx.run_id, step.id);
        let mut rx = self.deps.inputs.register(&key).await;
        self.deps.events.publish(tether_types::RuntimeEvent::new(
            "input.requested",
            json!({
                "run_id": ctx.run_id,
                "step_id": step.id,
                "prompt": prompt,
            }),
        ));

        let value = loop {
            if rx.borrow().is_some() {
                break rx.borrow().clone();
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.deps.inputs.remove(&key).await;
                    return Err(StepError::new(codes::RUN_CANCELLED, "run was cancelled"));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                }
            }
        };
        self.deps.inputs.remove(&key).await;

        let Some(value) = value else {
            return Err(StepError::new(
                codes::STEP_FAILED,
                "input channel closed without a value",
            ));
        };
        let state_key = input_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_input", step.id));
        let mut outcome = HandlerOutcome::with_output(value.clone());
        outcome.state_updates.insert(state_key, value);
        Ok(outcome)
    }

    async fn run_approval(
        &self,
        step: &StepNode,
        operation: &str,
        resource: &str,
        justification: Option<String>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let (request, token) = self
            .deps
            .approvals
            .request(operation, resource, ctx.zone, &ctx.run_id, justification)
            .await;

        match token {
            Some(token) => {
                let mut outcome = HandlerOutcome::with_output(json!({
                    "request_id": request.id,
                    "auto_approved": true,
                }));
                outcome
                    .state_updates
                    .insert(format!("{}_token", step.id), Value::String(token.token.clone()));
                // the slot tool_call steps read their token from
                outcome
                    .state_updates
                    .insert("approval_token".to_string(), Value::String(token.token));
                Ok(outcome)
            }
            None => Err(StepError::new(
                codes::APPROVAL_REQUIRED,
                format!(
                    "operation `{operation}` on `{resource}` awaits approval (request `{}`)",
                    request.id
                ),
            )),
        }
    }

    async fn run_gate(&self, policy: &str, ctx: &StepContext) -> Result<HandlerOutcome, StepError> {
        let Some(gate) = self.deps.policy.gate_policy(policy) else {
            return Err(StepError::new(
                codes::STEP_FAILED,
                format!("unknown gate policy `{policy}`"),
            ));
        };

        let output = ctx
            .state
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let quality_ctx = QualityContext {
            agent_id: ctx.run_id.clone(),
            zone: ctx.zone,
            input: ctx.input.clone(),
            output,
            metadata: Value::Object(ctx.state.clone()),
        };
        let execution = self.deps.quality.execute(&gate, &quality_ctx).await;

        if execution.blocked() {
            return Err(StepError::new(
                codes::GATE_FAILED,
                format!(
                    "gate `{policy}` blocked: {}",
                    execution.blocking_failures.join(", ")
                ),
            ));
        }
        Ok(HandlerOutcome::with_output(
            serde_json::to_value(&execution).unwrap_or(Value::Null),
        ))
    }

    async fn run_sub_agent(
        &self,
        step: &StepNode,
        task_class: &str,
        mode: Option<&str>,
        input: &Value,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let spawner = self.deps.sub_agents.read().await.clone();
        let Some(spawner) = spawner else {
            return Err(StepError::new(
                codes::HANDLER_MISSING,
                "no sub-agent spawner registered",
            ));
        };

        let resolved_input = resolve_references(input, &ctx.to_value());
        let output = spawner
            .spawn(task_class, mode, resolved_input, &ctx.run_id, ctx.zone)
            .await
            .map_err(|err| StepError::new(err.code(), err.to_string()))?;

        let mut outcome = HandlerOutcome::with_output(output.clone());
        outcome
            .state_updates
            .insert(format!("{}_output", step.id), output);
        Ok(outcome)
    }
}

/// Apply updates to a state map; `Null` removes the key.
pub fn apply_state_updates(state: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (key, value) in updates {
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}

/// Strings shaped `$path.to.value` resolve against the context view; all
/// other values pass through unchanged.
pub fn resolve_references(input: &Value, view: &Value) -> Value {
    match input {
        Value::String(text) => match text.strip_prefix('$') {
            Some(path) => resolve_path(view, path).cloned().unwrap_or(Value::Null),
            None => input.clone(),
        },
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_references(v, view)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_references(v, view)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::{ApprovalConfig, ApprovalManager};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_policy::{PolicyEngine, PolicyEngineConfig, QualityGateConfig};
    use tether_types::{ConditionOp, CoreResult, RetryPolicy};

    struct CannedModel {
        text: &'static str,
    }

    #[async_trait]
    impl ModelRouter for CannedModel {
        async fn complete(&self, _request: ModelRequest) -> CoreResult<crate::ModelCompletion> {
            Ok(crate::ModelCompletion {
                output: self.text.to_string(),
                provider: "mock".to_string(),
                model: "mock-1".to_string(),
                input_tokens: 10,
                output_tokens: 5,
                cost_usd: 0.001,
                latency_ms: 3,
            })
        }
    }

    struct CountingTools {
        calls: AtomicU32,
        requires_approval: bool,
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl ToolsCollaborator for CountingTools {
        async fn get(&self, name: &str) -> Option<crate::ToolDefinition> {
            Some(crate::ToolDefinition {
                name: name.to_string(),
                description: String::new(),
                requires_approval: self.requires_approval,
            })
        }

        async fn execute(
            &self,
            _name: &str,
            input: Value,
            _zone: Zone,
        ) -> CoreResult<crate::ToolOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Ok(crate::ToolOutcome {
                    success: false,
                    output: None,
                    error: Some("transient".to_string()),
                });
            }
            Ok(crate::ToolOutcome {
                success: true,
                output: Some(json!({"echo": input})),
                error: None,
            })
        }
    }

    fn executor(tools: Arc<CountingTools>) -> StepExecutor {
        let events = EventBus::new();
        StepExecutor::new(Arc::new(StepDeps {
            models: Arc::new(CannedModel { text: "Paris." }),
            tools,
            approvals: Arc::new(ApprovalManager::new(ApprovalConfig::default(), events.clone())),
            policy: Arc::new(PolicyEngine::new(PolicyEngineConfig::default())),
            quality: Arc::new(QualityGateExecutor::new(QualityGateConfig::default())),
            events,
            inputs: InputRegistry::default(),
            sub_agents: RwLock::new(None),
        }))
    }

    fn plain_tools() -> Arc<CountingTools> {
        Arc::new(CountingTools {
            calls: AtomicU32::new(0),
            requires_approval: false,
            fail_first: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn completion_step_updates_state_under_output_key() {
        let executor = executor(plain_tools());
        let step = StepNode::new(
            "answer",
            StepKind::Completion {
                prompt: None,
                preset: None,
                model: None,
                output_key: Some("output".to_string()),
            },
        );
        let ctx = StepContext::new("run-1", Zone::Green, json!({"question": "capital?"}));

        let result = executor.execute(&step, None, &ctx).await;
        assert!(result.success);
        assert_eq!(result.state_updates["output"], json!("Paris."));
        assert_eq!(result.output.unwrap()["usage"]["cost_usd"], json!(0.001));
    }

    #[tokio::test]
    async fn skip_if_short_circuits_to_next() {
        let executor = executor(plain_tools());
        let mut step = StepNode::new(
            "maybe",
            StepKind::Completion {
                prompt: None,
                preset: None,
                model: None,
                output_key: None,
            },
        )
        .with_next("after");
        step.skip_if = Some(Condition::new("input.skip", ConditionOp::Eq, json!(true)));

        let ctx = StepContext::new("run-1", Zone::Green, json!({"skip": true}));
        let result = executor.execute(&step, None, &ctx).await;
        assert!(result.success);
        assert_eq!(result.next_step.as_deref(), Some("after"));
        assert_eq!(result.output.unwrap()["skipped"], json!(true));
    }

    #[tokio::test]
    async fn zone_mismatch_is_a_typed_failure() {
        let executor = executor(plain_tools());
        let mut step = StepNode::new(
            "danger",
            StepKind::ToolCall {
                tool: "deploy".to_string(),
                input: Value::Null,
                output_key: None,
            },
        );
        step.required_zone = Some(Zone::Red);

        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        let result = executor.execute(&step, None, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, codes::ZONE_MISMATCH);
    }

    #[tokio::test]
    async fn tool_call_without_token_requests_approval() {
        let tools = Arc::new(CountingTools {
            calls: AtomicU32::new(0),
            requires_approval: true,
            fail_first: AtomicU32::new(0),
        });
        let executor = executor(tools.clone());
        let step = StepNode::new(
            "call",
            StepKind::ToolCall {
                tool: "deploy_production".to_string(),
                input: Value::Null,
                output_key: None,
            },
        );
        // yellow so no auto-approval
        let ctx = StepContext::new("run-1", Zone::Yellow, Value::Null);

        let result = executor.execute(&step, None, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, codes::APPROVAL_REQUIRED);
        assert_eq!(tools.calls.load(Ordering::SeqCst), 0);

        // a reviewer approves the pending request; the retry carries the token
        let pending = executor.deps().approvals.list_pending().await;
        assert_eq!(pending.len(), 1);
        let token = executor
            .deps()
            .approvals
            .approve(&pending[0].id, "ops-1", None)
            .await
            .unwrap();

        let mut ctx = ctx;
        ctx.approval_token = Some(token.token);
        let result = executor.execute(&step, None, &ctx).await;
        assert!(result.success);
        assert_eq!(tools.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_policy_retries_transient_tool_failures() {
        let tools = Arc::new(CountingTools {
            calls: AtomicU32::new(0),
            requires_approval: false,
            fail_first: AtomicU32::new(2),
        });
        let executor = executor(tools.clone());
        let mut step = StepNode::new(
            "flaky",
            StepKind::ToolCall {
                tool: "ping".to_string(),
                input: json!({"n": 1}),
                output_key: Some("ping".to_string()),
            },
        );
        step.retry = Some(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 5,
        });

        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        let result = executor.execute(&step, None, &ctx).await;
        assert!(result.success);
        assert_eq!(result.tool_calls, 1);
        assert_eq!(tools.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parallel_children_report_an_aggregated_tool_call_count() {
        let tools = plain_tools();
        let executor = executor(tools.clone());
        let ping = |id: &str| {
            StepNode::new(
                id,
                StepKind::ToolCall {
                    tool: "ping".to_string(),
                    input: json!({"from": id}),
                    output_key: Some(id.to_string()),
                },
            )
        };
        let fan = StepNode::new(
            "fan",
            StepKind::Parallel {
                children: vec!["a".to_string(), "b".to_string()],
                join: JoinPolicy::All,
            },
        );
        let routing = TaskRouting {
            task_class: "probe".to_string(),
            mode: "default".to_string(),
            entry_step: "fan".to_string(),
            exit_step: "fan".to_string(),
            steps: vec![fan.clone(), ping("a"), ping("b")],
            estimated_duration_ms: 0,
            estimated_cost_usd: 0.0,
        };

        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        let result = executor.execute(&fan, Some(&routing), &ctx).await;
        assert!(result.success);
        assert_eq!(result.tool_calls, 2);
        assert_eq!(tools.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conditional_picks_branch_from_context() {
        let executor = executor(plain_tools());
        let step = StepNode::new(
            "check",
            StepKind::Conditional {
                condition: tether_types::ConditionExpr::Leaf(Condition::new(
                    "state.count",
                    ConditionOp::Gte,
                    json!(3),
                )),
                if_true: Some("high".to_string()),
                if_false: Some("low".to_string()),
            },
        );

        let mut ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        ctx.state.insert("count".to_string(), json!(5));
        let result = executor.execute(&step, None, &ctx).await;
        assert_eq!(result.next_step.as_deref(), Some("high"));

        ctx.state.insert("count".to_string(), json!(1));
        let result = executor.execute(&step, None, &ctx).await;
        assert_eq!(result.next_step.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn state_update_operations_behave() {
        let executor = executor(plain_tools());
        let mut ctx = StepContext::new("run-1", Zone::Green, json!({"who": "ada"}));
        ctx.state.insert("count".to_string(), json!(2));
        ctx.state.insert("log".to_string(), json!(["a"]));

        let inc = StepNode::new(
            "inc",
            StepKind::StateUpdate {
                key: "count".to_string(),
                operation: StateOp::Increment,
                value: Some(json!(3)),
                value_from: None,
            },
        );
        let result = executor.execute(&inc, None, &ctx).await;
        assert_eq!(result.state_updates["count"], json!(5.0));

        let push = StepNode::new(
            "push",
            StepKind::StateUpdate {
                key: "log".to_string(),
                operation: StateOp::Append,
                value: None,
                value_from: Some("input.who".to_string()),
            },
        );
        let result = executor.execute(&push, None, &ctx).await;
        assert_eq!(result.state_updates["log"], json!(["a", "ada"]));

        let del = StepNode::new(
            "del",
            StepKind::StateUpdate {
                key: "log".to_string(),
                operation: StateOp::Delete,
                value: None,
                value_from: None,
            },
        );
        let result = executor.execute(&del, None, &ctx).await;
        assert!(result.state_updates["log"].is_null());
        apply_state_updates(&mut ctx.state, &result.state_updates);
        assert!(!ctx.state.contains_key("log"));
    }

    #[tokio::test]
    async fn wait_step_times_out_with_typed_error() {
        let executor = executor(plain_tools());
        let step = StepNode::new(
            "wait",
            StepKind::Wait {
                duration_ms: None,
                until: Some(Condition::new("state.ready", ConditionOp::Eq, json!(true))),
                poll_interval_ms: Some(20),
                poll_timeout_ms: Some(80),
                backoff: None,
            },
        );
        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        let result = executor.execute(&step, None, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, codes::POLLING_TIMEOUT);
    }

    #[tokio::test]
    async fn wait_step_sees_live_state_changes() {
        let executor = executor(plain_tools());
        let step = StepNode::new(
            "wait",
            StepKind::Wait {
                duration_ms: None,
                until: Some(Condition::new("state.status", ConditionOp::Eq, json!("ready"))),
                poll_interval_ms: Some(200),
                poll_timeout_ms: Some(5_000),
                backoff: Some(tether_types::BackoffPolicy {
                    initial_ms: 100,
                    max_ms: 2_000,
                    multiplier: 2.0,
                }),
            },
        );

        let shared = Arc::new(std::sync::RwLock::new("pending".to_string()));
        let shared_ref = shared.clone();
        let mut ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        ctx.live_state = Some(Arc::new(move || {
            json!({"state": {"status": shared_ref.read().unwrap().clone()}})
        }));
        tokio::spawn({
            let shared = shared.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1_500)).await;
                *shared.write().unwrap() = "ready".to_string();
            }
        });

        let started = Instant::now();
        let result = executor.execute(&step, None, &ctx).await;
        assert!(result.success, "error: {:?}", result.error);
        let output = result.output.unwrap();
        assert_eq!(output["condition_met"], json!(true));
        let attempts = output["metrics"]["attempts"].as_u64().unwrap();
        assert!((3..=6).contains(&attempts), "attempts: {attempts}");
        let intervals: Vec<u64> = output["metrics"]["intervals_ms"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect();
        for pair in intervals.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(started.elapsed() >= Duration::from_millis(1_400));
    }

    #[tokio::test]
    async fn wait_cancellation_is_prompt() {
        let executor = executor(plain_tools());
        let step = StepNode::new(
            "wait",
            StepKind::Wait {
                duration_ms: None,
                until: Some(Condition::new("state.never", ConditionOp::Eq, json!(true))),
                poll_interval_ms: Some(10_000),
                poll_timeout_ms: Some(60_000),
                backoff: None,
            },
        );
        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result = executor.execute(&step, None, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, codes::POLLING_CANCELLED);
        assert!(
            started.elapsed() <= Duration::from_millis(750),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn step_timeout_produces_step_timeout_code() {
        let executor = executor(plain_tools());
        let mut step = StepNode::new(
            "slow-wait",
            StepKind::Wait {
                duration_ms: Some(5_000),
                until: None,
                poll_interval_ms: None,
                poll_timeout_ms: None,
                backoff: None,
            },
        );
        step.timeout_ms = Some(50);

        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);
        let result = executor.execute(&step, None, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, codes::STEP_TIMEOUT);
    }

    #[tokio::test]
    async fn human_input_resumes_on_provided_value() {
        let executor = executor(plain_tools());
        let step = StepNode::new(
            "ask",
            StepKind::HumanInput {
                prompt: Some("pick one".to_string()),
                input_key: Some("choice".to_string()),
            },
        );
        let ctx = StepContext::new("run-1", Zone::Green, Value::Null);

        let inputs = executor.deps().inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            inputs.provide("run-1:ask", json!("option-b")).await;
        });

        let result = executor.execute(&step, None, &ctx).await;
        assert!(result.success);
        assert_eq!(result.state_updates["choice"], json!("option-b"));
    }

    #[tokio::test]
    async fn reference_resolution_walks_nested_values() {
        let view = json!({
            "input": {"to": "+1415"},
            "state": {"message": "hi"},
        });
        let resolved = resolve_references(
            &json!({"body": "$state.message", "to": "$input.to", "extra": ["$state.message", 1]}),
            &view,
        );
        assert_eq!(
            resolved,
            json!({"body": "hi", "to": "+1415", "extra": ["hi", 1]})
        );
    }
}
