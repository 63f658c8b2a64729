use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use tether_types::{CoreError, CoreResult, Zone};

use crate::conditions::eval_expr;
use crate::model::{GateCheck, GatePolicy, Severity};

/// Output-side context a quality gate inspects.
#[derive(Debug, Clone)]
pub struct QualityContext {
    pub agent_id: String,
    pub zone: Zone,
    pub input: Value,
    pub output: String,
    pub metadata: Value,
}

impl QualityContext {
    pub fn to_value(&self) -> Value {
        json!({
            "agent": self.agent_id,
            "zone": self.zone.as_str(),
            "input": self.input,
            "output": self.output,
            "metadata": self.metadata,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckVerdict {
    pub passed: bool,
    pub message: Option<String>,
}

impl CheckVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait QualityCheckHandler: Send + Sync {
    async fn run(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub severity: Severity,
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateExecution {
    pub gate_name: String,
    pub status: CheckStatus,
    pub checks: Vec<QualityCheckResult>,
    pub passed_count: usize,
    pub failed_count: usize,
    pub blocking_failures: Vec<String>,
    pub duration_ms: u64,
}

impl GateExecution {
    pub fn blocked(&self) -> bool {
        !self.blocking_failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct QualityGateConfig {
    pub check_timeout_ms: u64,
    pub gate_timeout_ms: u64,
    pub fail_fast: bool,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 5_000,
            gate_timeout_ms: 30_000,
            fail_fast: true,
        }
    }
}

/// Runs a gate policy's checks against an output. Handlers are selected by
/// check-name prefix; anything without a registered handler falls back to
/// the condition evaluator over the quality context.
pub struct QualityGateExecutor {
    handlers: RwLock<HashMap<String, Arc<dyn QualityCheckHandler>>>,
    config: QualityGateConfig,
}

impl QualityGateExecutor {
    pub fn new(config: QualityGateConfig) -> Self {
        let executor = Self {
            handlers: RwLock::new(HashMap::new()),
            config,
        };
        executor.register_handler("non_empty", Arc::new(NonEmptyCheck));
        executor.register_handler("min_length", Arc::new(MinLengthCheck));
        executor.register_handler("max_length", Arc::new(MaxLengthCheck));
        executor.register_handler("contains", Arc::new(ContainsCheck));
        executor.register_handler("regex_match", Arc::new(RegexMatchCheck));
        executor.register_handler("json_valid", Arc::new(JsonValidCheck));
        executor.register_handler("no_pii", Arc::new(NoPiiCheck));
        executor.register_handler("cost_within_budget", Arc::new(CostBudgetCheck));
        executor
    }

    pub fn register_handler(&self, prefix: impl Into<String>, handler: Arc<dyn QualityCheckHandler>) {
        self.handlers.write().insert(prefix.into(), handler);
    }

    pub async fn execute(&self, gate: &GatePolicy, ctx: &QualityContext) -> GateExecution {
        let started = Instant::now();
        let overall = tokio::time::timeout(
            Duration::from_millis(self.config.gate_timeout_ms),
            self.execute_inner(gate, ctx),
        )
        .await;

        match overall {
            Ok(mut execution) => {
                execution.duration_ms = started.elapsed().as_millis() as u64;
                execution
            }
            Err(_) => GateExecution {
                gate_name: gate.meta.name.clone(),
                status: CheckStatus::Error,
                checks: Vec::new(),
                passed_count: 0,
                failed_count: 0,
                blocking_failures: vec![format!(
                    "gate `{}` timed out after {}ms",
                    gate.meta.name, self.config.gate_timeout_ms
                )],
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    async fn execute_inner(&self, gate: &GatePolicy, ctx: &QualityContext) -> GateExecution {
        let mut checks = Vec::with_capacity(gate.checks.len());
        let mut blocking_failures = Vec::new();
        let mut halted = false;

        for check in &gate.checks {
            if halted {
                checks.push(QualityCheckResult {
                    name: check.name.clone(),
                    status: CheckStatus::Skipped,
                    severity: check.severity,
                    blocking: check.blocking,
                    message: None,
                    duration_ms: 0,
                });
                continue;
            }

            let check_started = Instant::now();
            let verdict = tokio::time::timeout(
                Duration::from_millis(self.config.check_timeout_ms),
                self.run_check(check, ctx),
            )
            .await;
            let duration_ms = check_started.elapsed().as_millis() as u64;

            let (status, message) = match verdict {
                Ok(Ok(verdict)) if verdict.passed => (CheckStatus::Passed, verdict.message),
                Ok(Ok(verdict)) => (CheckStatus::Failed, verdict.message),
                Ok(Err(err)) => (CheckStatus::Error, Some(err.to_string())),
                Err(_) => (
                    CheckStatus::Error,
                    Some(format!(
                        "check timed out after {}ms",
                        self.config.check_timeout_ms
                    )),
                ),
            };

            if check.blocking && matches!(status, CheckStatus::Failed | CheckStatus::Error) {
                blocking_failures.push(check.name.clone());
                if self.config.fail_fast {
                    halted = true;
                }
            }

            checks.push(QualityCheckResult {
                name: check.name.clone(),
                status,
                severity: check.severity,
                blocking: check.blocking,
                message,
                duration_ms,
            });
        }

        let passed_count = checks
            .iter()
            .filter(|c| c.status == CheckStatus::Passed)
            .count();
        let failed_count = checks
            .iter()
            .filter(|c| matches!(c.status, CheckStatus::Failed | CheckStatus::Error))
            .count();
        let status = if checks.is_empty() {
            CheckStatus::Skipped
        } else if !blocking_failures.is_empty() {
            CheckStatus::Failed
        } else {
            CheckStatus::Passed
        };

        debug!(gate = %gate.meta.name, ?status, passed_count, failed_count, "quality gate executed");

        GateExecution {
            gate_name: gate.meta.name.clone(),
            status,
            checks,
            passed_count,
            failed_count,
            blocking_failures,
            duration_ms: 0,
        }
    }

    async fn run_check(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let handler = {
            let handlers = self.handlers.read();
            // longest registered prefix wins
            let mut best: Option<(&String, &Arc<dyn QualityCheckHandler>)> = None;
            for (prefix, handler) in handlers.iter() {
                if check.name.starts_with(prefix.as_str())
                    && best.map_or(true, |(current, _)| prefix.len() > current.len())
                {
                    best = Some((prefix, handler));
                }
            }
            best.map(|(_, handler)| handler.clone())
        };

        match handler {
            Some(handler) => handler.run(check, ctx).await,
            None => {
                let passed = eval_expr(&check.condition, &ctx.to_value());
                Ok(if passed {
                    CheckVerdict::pass()
                } else {
                    CheckVerdict::fail(
                        check
                            .message
                            .clone()
                            .unwrap_or_else(|| format!("condition for `{}` not met", check.name)),
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in checks
// ---------------------------------------------------------------------------

struct NonEmptyCheck;
#[async_trait]
impl QualityCheckHandler for NonEmptyCheck {
    async fn run(&self, _check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        Ok(if ctx.output.trim().is_empty() {
            CheckVerdict::fail("output is empty")
        } else {
            CheckVerdict::pass()
        })
    }
}

struct MinLengthCheck;
#[async_trait]
impl QualityCheckHandler for MinLengthCheck {
    async fn run(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let min = check.params.get("min").and_then(Value::as_u64).unwrap_or(1) as usize;
        let len = ctx.output.chars().count();
        Ok(if len >= min {
            CheckVerdict::pass()
        } else {
            CheckVerdict::fail(format!("output length {len} below minimum {min}"))
        })
    }
}

struct MaxLengthCheck;
#[async_trait]
impl QualityCheckHandler for MaxLengthCheck {
    async fn run(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let max = check
            .params
            .get("max")
            .and_then(Value::as_u64)
            .unwrap_or(u64::MAX) as usize;
        let len = ctx.output.chars().count();
        Ok(if len <= max {
            CheckVerdict::pass()
        } else {
            CheckVerdict::fail(format!("output length {len} exceeds maximum {max}"))
        })
    }
}

struct ContainsCheck;
#[async_trait]
impl QualityCheckHandler for ContainsCheck {
    async fn run(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let Some(needle) = check.params.get("substring").and_then(Value::as_str) else {
            return Err(CoreError::Validation(format!(
                "check `{}` needs params.substring",
                check.name
            )));
        };
        Ok(if ctx.output.contains(needle) {
            CheckVerdict::pass()
        } else {
            CheckVerdict::fail(format!("output does not contain `{needle}`"))
        })
    }
}

struct RegexMatchCheck;
#[async_trait]
impl QualityCheckHandler for RegexMatchCheck {
    async fn run(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let Some(pattern) = check.params.get("pattern").and_then(Value::as_str) else {
            return Err(CoreError::Validation(format!(
                "check `{}` needs params.pattern",
                check.name
            )));
        };
        let re = regex::Regex::new(pattern)
            .map_err(|e| CoreError::Validation(format!("invalid pattern: {e}")))?;
        Ok(if re.is_match(&ctx.output) {
            CheckVerdict::pass()
        } else {
            CheckVerdict::fail(format!("output does not match `{pattern}`"))
        })
    }
}

struct JsonValidCheck;
#[async_trait]
impl QualityCheckHandler for JsonValidCheck {
    async fn run(&self, _check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        Ok(match serde_json::from_str::<Value>(&ctx.output) {
            Ok(_) => CheckVerdict::pass(),
            Err(err) => CheckVerdict::fail(format!("output is not valid JSON: {err}")),
        })
    }
}

struct NoPiiCheck;
#[async_trait]
impl QualityCheckHandler for NoPiiCheck {
    async fn run(&self, _check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let mut found = Vec::new();
        for (label, pattern) in [
            ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("credit_card", r"\b(?:\d{4}[ -]?){3}\d{4}\b"),
            ("email", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
        ] {
            let re = regex::Regex::new(pattern)
                .map_err(|e| CoreError::Validation(format!("invalid PII pattern: {e}")))?;
            if re.is_match(&ctx.output) {
                found.push(label);
            }
        }
        Ok(if found.is_empty() {
            CheckVerdict::pass()
        } else {
            CheckVerdict::fail(format!("output contains possible PII: {}", found.join(", ")))
        })
    }
}

struct CostBudgetCheck;
#[async_trait]
impl QualityCheckHandler for CostBudgetCheck {
    async fn run(&self, check: &GateCheck, ctx: &QualityContext) -> CoreResult<CheckVerdict> {
        let Some(budget) = check.params.get("budget_usd").and_then(Value::as_f64) else {
            return Ok(CheckVerdict::pass());
        };
        let cost = ctx
            .metadata
            .get("cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok(if cost <= budget {
            CheckVerdict::pass()
        } else {
            CheckVerdict::fail(format!("cost {cost:.4} exceeds budget {budget:.4}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GateStage, PolicyMeta, ZoneScope};
    use tether_types::{Condition, ConditionExpr, ConditionOp};

    fn gate(checks: Vec<GateCheck>) -> GatePolicy {
        GatePolicy {
            meta: PolicyMeta::new("quality", 0),
            zone: ZoneScope::All,
            stage: GateStage::Output,
            checks,
        }
    }

    fn check(name: &str, blocking: bool, params: Value) -> GateCheck {
        GateCheck {
            name: name.to_string(),
            condition: ConditionExpr::Leaf(Condition::new(
                "output",
                ConditionOp::Exists,
                json!(true),
            )),
            severity: Severity::Error,
            blocking,
            message: None,
            params,
        }
    }

    fn ctx(output: &str) -> QualityContext {
        QualityContext {
            agent_id: "agent-1".to_string(),
            zone: Zone::Green,
            input: Value::Null,
            output: output.to_string(),
            metadata: json!({"cost_usd": 0.02}),
        }
    }

    #[tokio::test]
    async fn pii_in_output_blocks_the_gate() {
        let executor = QualityGateExecutor::new(QualityGateConfig::default());
        let gate = gate(vec![check("no_pii", true, Value::Null)]);

        let clean = executor.execute(&gate, &ctx("Paris.")).await;
        assert_eq!(clean.status, CheckStatus::Passed);
        assert!(!clean.blocked());

        let leaking = executor
            .execute(&gate, &ctx("Contact jane.doe@example.com for details"))
            .await;
        assert_eq!(leaking.status, CheckStatus::Failed);
        assert!(leaking.blocked());
        assert_eq!(leaking.blocking_failures, vec!["no_pii".to_string()]);
    }

    #[tokio::test]
    async fn fail_fast_skips_remaining_checks() {
        let executor = QualityGateExecutor::new(QualityGateConfig::default());
        let gate = gate(vec![
            check("min_length", true, json!({"min": 100})),
            check("non_empty", true, Value::Null),
        ]);

        let execution = executor.execute(&gate, &ctx("short")).await;
        assert_eq!(execution.status, CheckStatus::Failed);
        assert_eq!(execution.checks[0].status, CheckStatus::Failed);
        assert_eq!(execution.checks[1].status, CheckStatus::Skipped);
    }

    #[tokio::test]
    async fn non_blocking_failures_leave_gate_passed() {
        let executor = QualityGateExecutor::new(QualityGateConfig::default());
        let gate = gate(vec![
            check("contains", false, json!({"substring": "absent"})),
            check("non_empty", true, Value::Null),
        ]);

        let execution = executor.execute(&gate, &ctx("some output")).await;
        assert_eq!(execution.status, CheckStatus::Passed);
        assert_eq!(execution.failed_count, 1);
        assert!(!execution.blocked());
    }

    #[tokio::test]
    async fn builtin_checks_cover_length_json_and_cost() {
        let executor = QualityGateExecutor::new(QualityGateConfig::default());
        let gate = gate(vec![
            check("min_length", true, json!({"min": 2})),
            check("max_length", true, json!({"max": 64})),
            check("json_valid", true, Value::Null),
            check("cost_within_budget", true, json!({"budget_usd": 0.05})),
        ]);

        let execution = executor.execute(&gate, &ctx(r#"{"answer": 42}"#)).await;
        assert_eq!(execution.status, CheckStatus::Passed);
        assert_eq!(execution.passed_count, 4);
    }

    #[tokio::test]
    async fn unknown_check_falls_back_to_condition_evaluation() {
        let executor = QualityGateExecutor::new(QualityGateConfig::default());
        let gate = gate(vec![GateCheck {
            name: "custom_output_check".to_string(),
            condition: ConditionExpr::Leaf(Condition::new(
                "output",
                ConditionOp::Contains,
                json!("Paris"),
            )),
            severity: Severity::Critical,
            blocking: true,
            message: Some("answer must mention Paris".to_string()),
            params: Value::Null,
        }]);

        let good = executor.execute(&gate, &ctx("Paris.")).await;
        assert_eq!(good.status, CheckStatus::Passed);

        let bad = executor.execute(&gate, &ctx("London.")).await;
        assert_eq!(bad.status, CheckStatus::Failed);
        assert_eq!(
            bad.checks[0].message.as_deref(),
            Some("answer must mention Paris")
        );
    }

    #[tokio::test]
    async fn slow_check_times_out_as_error() {
        struct SlowCheck;
        #[async_trait]
        impl QualityCheckHandler for SlowCheck {
            async fn run(
                &self,
                _check: &GateCheck,
                _ctx: &QualityContext,
            ) -> CoreResult<CheckVerdict> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(CheckVerdict::pass())
            }
        }

        let executor = QualityGateExecutor::new(QualityGateConfig {
            check_timeout_ms: 20,
            ..Default::default()
        });
        executor.register_handler("slow", Arc::new(SlowCheck));
        let gate = gate(vec![check("slow_probe", true, Value::Null)]);

        let execution = executor.execute(&gate, &ctx("anything")).await;
        assert_eq!(execution.checks[0].status, CheckStatus::Error);
        assert!(execution.blocked());
    }
}
