use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use tether_types::Zone;

use crate::conditions::{eval_condition, eval_expr, references_volatile_field};
use crate::model::{
    wildcard_matches, GatePolicy, GateStage, KillswitchPolicy, Policy, PolicyStatus,
    RateLimitPolicy, Severity,
};

/// Request context a policy decision is made against.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub actor: Option<String>,
    pub action: String,
    pub resource: String,
    pub zone: Zone,
    pub timestamp: DateTime<Utc>,
    pub environment: String,
    pub data: Value,
}

impl PolicyContext {
    pub fn new(action: impl Into<String>, resource: impl Into<String>, zone: Zone) -> Self {
        Self {
            actor: None,
            action: action.into(),
            resource: resource.into(),
            zone,
            timestamp: Utc::now(),
            environment: "default".to_string(),
            data: Value::Null,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// The JSON view conditions evaluate against.
    pub fn to_value(&self) -> Value {
        json!({
            "request": {
                "action": self.action,
                "resource": self.resource,
                "zone": self.zone.as_str(),
            },
            "actor": self.actor,
            "environment": self.environment,
            "timestamp": self.timestamp.timestamp(),
            "data": self.data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Warn,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy_id: String,
    pub policy_name: String,
    pub policy_kind: String,
    pub passed: bool,
    pub action: PolicyAction,
    pub failures: Vec<CheckOutcome>,
    pub duration_ms: u64,
    pub cached: bool,
}

impl PolicyResult {
    pub fn has_critical_failure(&self) -> bool {
        self.failures
            .iter()
            .any(|f| !f.passed && f.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub overall_action: PolicyAction,
    pub results: Vec<PolicyResult>,
    pub critical_failures: Vec<String>,
    pub total_duration_ms: u64,
}

impl EvaluationReport {
    pub fn allowed(&self) -> bool {
        self.overall_action != PolicyAction::Deny
    }
}

pub type ViolationCallback = Arc<dyn Fn(&PolicyResult) + Send + Sync>;

#[derive(Clone)]
pub struct PolicyEngineConfig {
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    /// Invoked once per failing policy result, after the decision is known
    /// and before the report is returned.
    pub on_violation: Option<ViolationCallback>,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_seconds: 5,
            on_violation: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillswitchState {
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_by: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    window_start: i64,
    count: u32,
}

struct CachedVerdict {
    result: PolicyResult,
    expires_at: DateTime<Utc>,
}

/// Evaluates gate, killswitch, and rate-limit policies deterministically.
/// Killswitch latches and rate buckets are process-wide and mutex-protected;
/// multiple evaluators may run in parallel.
pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
    killswitches: Mutex<HashMap<String, KillswitchState>>,
    rate_buckets: Mutex<HashMap<String, RateBucket>>,
    cache: Mutex<HashMap<String, CachedVerdict>>,
    config: PolicyEngineConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyEngineConfig) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            killswitches: Mutex::new(HashMap::new()),
            rate_buckets: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn register(&self, policy: Policy) {
        self.policies.write().push(policy);
    }

    pub fn remove(&self, policy_id: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.meta().id != policy_id);
        policies.len() != before
    }

    pub fn list(&self) -> Vec<Policy> {
        self.policies.read().clone()
    }

    /// Gate policy lookup by name, for the quality-gate executor.
    pub fn gate_policy(&self, name: &str) -> Option<GatePolicy> {
        self.policies.read().iter().find_map(|p| match p {
            Policy::Gate(gate) if gate.meta.name == name => Some(gate.clone()),
            _ => None,
        })
    }

    pub fn killswitch_state(&self, policy_id: &str) -> Option<KillswitchState> {
        self.killswitches.lock().get(policy_id).cloned()
    }

    /// Clear a latched killswitch. A reset of an unlatched switch is a no-op.
    pub fn reset_killswitch(&self, policy_id: &str, actor: &str) {
        let mut latches = self.killswitches.lock();
        if let Some(state) = latches.get_mut(policy_id) {
            state.triggered = false;
            state.triggered_at = None;
            state.reason = None;
            state.reset_by = Some(actor.to_string());
        }
    }

    pub fn evaluate(&self, ctx: &PolicyContext) -> EvaluationReport {
        let started = Instant::now();
        let ctx_value = ctx.to_value();

        let mut applicable: Vec<Policy> = self
            .policies
            .read()
            .iter()
            .filter(|p| p.meta().status == PolicyStatus::Active && self.applies(p, ctx))
            .cloned()
            .collect();
        // priority descending, ties broken by id: deterministic across runs
        applicable.sort_by(|a, b| {
            b.meta()
                .priority
                .cmp(&a.meta().priority)
                .then_with(|| a.meta().id.cmp(&b.meta().id))
        });

        let mut results = Vec::with_capacity(applicable.len());
        for policy in &applicable {
            let cache_key = self.cache_key(policy, ctx);
            if let Some(key) = &cache_key {
                if let Some(hit) = self.cached_verdict(key) {
                    results.push(hit);
                    continue;
                }
            }

            let policy_started = Instant::now();
            let result = match policy {
                Policy::Gate(gate) => self.evaluate_gate(gate, &ctx_value),
                Policy::Killswitch(ks) => self.evaluate_killswitch(ks, &ctx_value),
                Policy::RateLimit(rl) => self.evaluate_rate_limit(rl, ctx),
            };
            let mut result = result;
            result.duration_ms = policy_started.elapsed().as_millis() as u64;

            // only positive verdicts are cached
            if result.passed {
                if let Some(key) = cache_key {
                    self.cache_verdict(key, &result);
                }
            }
            results.push(result);
        }

        let critical_failures: Vec<String> = results
            .iter()
            .filter(|r| r.has_critical_failure())
            .map(|r| r.policy_id.clone())
            .collect();
        let overall_action = if !critical_failures.is_empty() {
            PolicyAction::Deny
        } else if results.iter().all(|r| r.passed) {
            PolicyAction::Allow
        } else {
            PolicyAction::Warn
        };

        if let Some(on_violation) = &self.config.on_violation {
            for result in results.iter().filter(|r| !r.passed) {
                on_violation(result);
            }
        }

        EvaluationReport {
            overall_action,
            results,
            critical_failures,
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn applies(&self, policy: &Policy, ctx: &PolicyContext) -> bool {
        match policy {
            Policy::Gate(gate) => {
                gate.stage == GateStage::Request && gate.zone.applies_to(ctx.zone)
            }
            Policy::Killswitch(ks) => ks
                .target
                .as_deref()
                .map_or(true, |target| wildcard_matches(target, &ctx.action)),
            Policy::RateLimit(rl) => wildcard_matches(&rl.resource, &ctx.resource),
        }
    }

    fn evaluate_gate(&self, gate: &GatePolicy, ctx_value: &Value) -> PolicyResult {
        let mut failures = Vec::new();
        for check in &gate.checks {
            if eval_expr(&check.condition, ctx_value) {
                continue;
            }
            let critical_block = check.blocking && check.severity == Severity::Critical;
            failures.push(CheckOutcome {
                name: check.name.clone(),
                passed: false,
                severity: check.severity,
                blocking: check.blocking,
                message: check.message.clone(),
                retry_after_seconds: None,
            });
            if critical_block {
                break;
            }
        }
        let passed = !failures
            .iter()
            .any(|f| matches!(f.severity, Severity::Error | Severity::Critical));
        let action = if failures.iter().any(|f| f.severity == Severity::Critical) {
            PolicyAction::Deny
        } else if passed {
            PolicyAction::Allow
        } else {
            PolicyAction::Warn
        };
        PolicyResult {
            policy_id: gate.meta.id.clone(),
            policy_name: gate.meta.name.clone(),
            policy_kind: "gate".to_string(),
            passed,
            action,
            failures,
            duration_ms: 0,
            cached: false,
        }
    }

    fn evaluate_killswitch(&self, ks: &KillswitchPolicy, ctx_value: &Value) -> PolicyResult {
        let mut latches = self.killswitches.lock();
        let state = latches.entry(ks.meta.id.clone()).or_insert(KillswitchState {
            triggered: false,
            triggered_at: None,
            reason: None,
            reset_by: None,
        });

        if !state.triggered {
            let fired = ks.triggers.iter().find(|trigger| {
                !trigger.conditions.is_empty()
                    && trigger.conditions.iter().all(|c| eval_condition(c, ctx_value))
            });
            if let Some(trigger) = fired {
                state.triggered = true;
                state.triggered_at = Some(Utc::now());
                state.reason = Some(trigger.name.clone());
                debug!(killswitch = %ks.meta.name, trigger = %trigger.name, "killswitch latched");
            }
        }

        let triggered = state.triggered;
        let reason = state.reason.clone();
        drop(latches);

        let failures = if triggered {
            vec![CheckOutcome {
                name: "killswitch".to_string(),
                passed: false,
                severity: Severity::Critical,
                blocking: true,
                message: Some(format!(
                    "killswitch `{}` is latched ({})",
                    ks.meta.name,
                    reason.unwrap_or_else(|| "manual".to_string())
                )),
                retry_after_seconds: None,
            }]
        } else {
            Vec::new()
        };

        PolicyResult {
            policy_id: ks.meta.id.clone(),
            policy_name: ks.meta.name.clone(),
            policy_kind: "killswitch".to_string(),
            passed: !triggered,
            action: if triggered {
                PolicyAction::Deny
            } else {
                PolicyAction::Allow
            },
            failures,
            duration_ms: 0,
            cached: false,
        }
    }

    fn evaluate_rate_limit(&self, rl: &RateLimitPolicy, ctx: &PolicyContext) -> PolicyResult {
        let actor = ctx.actor.as_deref().unwrap_or("anonymous");
        let now = ctx.timestamp.timestamp();
        let mut buckets = self.rate_buckets.lock();

        let mut failures = Vec::new();
        for (index, window) in rl.windows.iter().enumerate() {
            let duration = window.duration_seconds.max(1) as i64;
            // aligned fixed buckets: deterministic resets at bucket boundaries
            let window_start = now - now.rem_euclid(duration);
            let key = format!("{}|{}|{}|{}", rl.meta.id, ctx.resource, actor, index);
            let bucket = buckets.entry(key).or_insert(RateBucket {
                window_start,
                count: 0,
            });
            if bucket.window_start != window_start {
                bucket.window_start = window_start;
                bucket.count = 0;
            }
            if bucket.count >= window.max_requests {
                let retry_after = (bucket.window_start + duration - now).max(0) as u64;
                failures.push(CheckOutcome {
                    name: format!("window_{}s", window.duration_seconds),
                    passed: false,
                    severity: Severity::Critical,
                    blocking: true,
                    message: Some(format!(
                        "rate limit of {} per {}s exceeded for `{}`",
                        window.max_requests, window.duration_seconds, ctx.resource
                    )),
                    retry_after_seconds: Some(retry_after),
                });
            } else {
                bucket.count += 1;
            }
        }

        let passed = failures.is_empty();
        PolicyResult {
            policy_id: rl.meta.id.clone(),
            policy_name: rl.meta.name.clone(),
            policy_kind: "rate_limit".to_string(),
            passed,
            action: if passed {
                PolicyAction::Allow
            } else {
                PolicyAction::Deny
            },
            failures,
            duration_ms: 0,
            cached: false,
        }
    }

    fn cache_key(&self, policy: &Policy, ctx: &PolicyContext) -> Option<String> {
        if !self.config.cache_enabled {
            return None;
        }
        // stateful policies and volatile conditions never hit the cache
        let Policy::Gate(gate) = policy else {
            return None;
        };
        if gate
            .checks
            .iter()
            .any(|c| references_volatile_field(&c.condition))
        {
            return None;
        }
        Some(format!(
            "{}|{}|{}|{}",
            gate.meta.id,
            ctx.actor.as_deref().unwrap_or(""),
            ctx.action,
            ctx.resource
        ))
    }

    fn cached_verdict(&self, key: &str) -> Option<PolicyResult> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(hit) if hit.expires_at > Utc::now() => {
                let mut result = hit.result.clone();
                result.cached = true;
                Some(result)
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_verdict(&self, key: String, result: &PolicyResult) {
        self.cache.lock().insert(
            key,
            CachedVerdict {
                result: result.clone(),
                expires_at: Utc::now()
                    + chrono::Duration::seconds(self.config.cache_ttl_seconds as i64),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GateCheck, KillswitchTrigger, PolicyMeta, RateLimitWindow, ZoneScope};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_types::{Condition, ConditionExpr, ConditionOp};

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyEngineConfig::default())
    }

    fn deny_red_deploys() -> Policy {
        Policy::Gate(GatePolicy {
            meta: PolicyMeta::new("no-red-deploys", 100),
            zone: ZoneScope::Red,
            stage: GateStage::Request,
            checks: vec![GateCheck {
                name: "action-not-deploy".to_string(),
                condition: ConditionExpr::Leaf(Condition::new(
                    "request.action",
                    ConditionOp::Neq,
                    json!("deploy"),
                )),
                severity: Severity::Critical,
                blocking: true,
                message: Some("deploys are blocked in the red zone".to_string()),
                params: Value::Null,
            }],
        })
    }

    #[test]
    fn gate_denies_on_critical_failure() {
        let engine = engine();
        engine.register(deny_red_deploys());

        let report = engine.evaluate(&PolicyContext::new("deploy", "prod", Zone::Red));
        assert_eq!(report.overall_action, PolicyAction::Deny);
        assert_eq!(report.critical_failures.len(), 1);

        let report = engine.evaluate(&PolicyContext::new("read", "prod", Zone::Red));
        assert_eq!(report.overall_action, PolicyAction::Allow);

        // gate is scoped to red; green traffic never sees it
        let report = engine.evaluate(&PolicyContext::new("deploy", "prod", Zone::Green));
        assert_eq!(report.overall_action, PolicyAction::Allow);
        assert!(report.results.is_empty());
    }

    #[test]
    fn evaluation_is_deterministic_and_priority_ordered() {
        let engine = engine();
        let mut low = PolicyMeta::new("low", 1);
        low.id = "b-low".to_string();
        let mut high = PolicyMeta::new("high", 50);
        high.id = "a-high".to_string();
        engine.register(Policy::Gate(GatePolicy {
            meta: low,
            zone: ZoneScope::All,
            stage: GateStage::Request,
            checks: vec![],
        }));
        engine.register(Policy::Gate(GatePolicy {
            meta: high,
            zone: ZoneScope::All,
            stage: GateStage::Request,
            checks: vec![],
        }));

        let ctx = PolicyContext::new("act", "res", Zone::Green);
        let first = engine.evaluate(&ctx);
        let second = engine.evaluate(&ctx);
        let names: Vec<&str> = first.results.iter().map(|r| r.policy_name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
        assert_eq!(
            first
                .results
                .iter()
                .map(|r| r.policy_id.as_str())
                .collect::<Vec<_>>(),
            second
                .results
                .iter()
                .map(|r| r.policy_id.as_str())
                .collect::<Vec<_>>()
        );
        assert_eq!(first.overall_action, second.overall_action);
    }

    #[test]
    fn killswitch_latches_until_reset() {
        let engine = engine();
        let policy = KillswitchPolicy {
            meta: PolicyMeta::new("emergency-stop", 1000),
            target: Some("send_*".to_string()),
            triggers: vec![KillswitchTrigger {
                name: "panic-flag".to_string(),
                conditions: vec![Condition::new("data.panic", ConditionOp::Eq, json!(true))],
            }],
        };
        let policy_id = policy.meta.id.clone();
        engine.register(Policy::Killswitch(policy));

        let calm = PolicyContext::new("send_sms", "sms", Zone::Yellow);
        assert_eq!(engine.evaluate(&calm).overall_action, PolicyAction::Allow);

        let panic =
            PolicyContext::new("send_sms", "sms", Zone::Yellow).with_data(json!({"panic": true}));
        assert_eq!(engine.evaluate(&panic).overall_action, PolicyAction::Deny);

        // latched: even calm contexts are denied now
        assert_eq!(engine.evaluate(&calm).overall_action, PolicyAction::Deny);
        assert!(engine.killswitch_state(&policy_id).unwrap().triggered);

        engine.reset_killswitch(&policy_id, "ops-1");
        assert_eq!(engine.evaluate(&calm).overall_action, PolicyAction::Allow);
    }

    #[test]
    fn rate_limit_allows_exactly_max_within_window() {
        let engine = engine();
        engine.register(Policy::RateLimit(RateLimitPolicy {
            meta: PolicyMeta::new("api-limit", 10),
            resource: "api/*".to_string(),
            windows: vec![RateLimitWindow {
                duration_seconds: 3600,
                max_requests: 3,
            }],
        }));

        let ctx = PolicyContext::new("call", "api/users", Zone::Green).with_actor("alice");
        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..5 {
            match engine.evaluate(&ctx).overall_action {
                PolicyAction::Deny => denied += 1,
                _ => allowed += 1,
            }
        }
        assert_eq!(allowed, 3);
        assert_eq!(denied, 2);

        // a different actor has its own bucket
        let other = PolicyContext::new("call", "api/users", Zone::Green).with_actor("bob");
        assert_eq!(engine.evaluate(&other).overall_action, PolicyAction::Allow);

        // denials carry a retry hint
        let report = engine.evaluate(&ctx);
        let failure = &report.results[0].failures[0];
        assert!(failure.retry_after_seconds.is_some());
    }

    #[test]
    fn rate_limit_resets_in_next_bucket() {
        let engine = engine();
        engine.register(Policy::RateLimit(RateLimitPolicy {
            meta: PolicyMeta::new("tiny", 10),
            resource: "r".to_string(),
            windows: vec![RateLimitWindow {
                duration_seconds: 60,
                max_requests: 1,
            }],
        }));

        let mut ctx = PolicyContext::new("call", "r", Zone::Green);
        assert_eq!(engine.evaluate(&ctx).overall_action, PolicyAction::Allow);
        assert_eq!(engine.evaluate(&ctx).overall_action, PolicyAction::Deny);

        // advance into the next aligned bucket
        ctx.timestamp = ctx.timestamp + chrono::Duration::seconds(120);
        assert_eq!(engine.evaluate(&ctx).overall_action, PolicyAction::Allow);
    }

    #[test]
    fn on_violation_fires_per_failing_result() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_ref = hits.clone();
        let engine = PolicyEngine::new(PolicyEngineConfig {
            on_violation: Some(Arc::new(move |result: &PolicyResult| {
                assert!(!result.passed);
                hits_ref.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        engine.register(deny_red_deploys());

        engine.evaluate(&PolicyContext::new("deploy", "prod", Zone::Red));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        engine.evaluate(&PolicyContext::new("read", "prod", Zone::Red));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn positive_gate_verdicts_are_cached() {
        let engine = engine();
        engine.register(Policy::Gate(GatePolicy {
            meta: PolicyMeta::new("stable-gate", 5),
            zone: ZoneScope::All,
            stage: GateStage::Request,
            checks: vec![GateCheck {
                name: "always".to_string(),
                condition: ConditionExpr::Leaf(Condition::new(
                    "request.action",
                    ConditionOp::Exists,
                    json!(true),
                )),
                severity: Severity::Error,
                blocking: false,
                message: None,
                params: Value::Null,
            }],
        }));

        let ctx = PolicyContext::new("act", "res", Zone::Green);
        assert!(!engine.evaluate(&ctx).results[0].cached);
        assert!(engine.evaluate(&ctx).results[0].cached);
    }

    #[test]
    fn volatile_conditions_bypass_the_cache() {
        let engine = engine();
        engine.register(Policy::Gate(GatePolicy {
            meta: PolicyMeta::new("volatile-gate", 5),
            zone: ZoneScope::All,
            stage: GateStage::Request,
            checks: vec![GateCheck {
                name: "flag".to_string(),
                condition: ConditionExpr::Leaf(Condition::new(
                    "data.flag",
                    ConditionOp::Eq,
                    json!(true),
                )),
                severity: Severity::Critical,
                blocking: true,
                message: None,
                params: Value::Null,
            }],
        }));

        let good = PolicyContext::new("act", "res", Zone::Green).with_data(json!({"flag": true}));
        assert_eq!(engine.evaluate(&good).overall_action, PolicyAction::Allow);
        assert!(!engine.evaluate(&good).results[0].cached);

        // same (actor, action, resource) but different data must re-evaluate
        let bad = PolicyContext::new("act", "res", Zone::Green).with_data(json!({"flag": false}));
        assert_eq!(engine.evaluate(&bad).overall_action, PolicyAction::Deny);
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let engine = engine();
        let mut policy = deny_red_deploys();
        if let Policy::Gate(gate) = &mut policy {
            gate.meta.status = PolicyStatus::Disabled;
        }
        engine.register(policy);
        let report = engine.evaluate(&PolicyContext::new("deploy", "prod", Zone::Red));
        assert_eq!(report.overall_action, PolicyAction::Allow);
        assert!(report.results.is_empty());
    }
}
