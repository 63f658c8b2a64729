use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::RwLock;
use serde_json::json;

use tether_types::CoreResult;

use crate::context::{ComplianceContext, Regulation, Violation, ViolationSeverity};
use crate::framework::{ComplianceGate, GateCheckOutcome};

#[derive(Debug, Clone)]
pub struct Soc2Config {
    /// Wildcard patterns over actions that require MFA.
    pub sensitive_actions: Vec<String>,
    pub session_timeout_minutes: i64,
    pub max_failed_logins: usize,
    pub lockout_cooldown_minutes: i64,
    pub anomaly_threshold: f64,
    pub audit_logging_enabled: bool,
}

impl Default for Soc2Config {
    fn default() -> Self {
        Self {
            sensitive_actions: vec![
                "delete_*".to_string(),
                "export_*".to_string(),
                "deploy_*".to_string(),
                "grant_*".to_string(),
            ],
            session_timeout_minutes: 30,
            max_failed_logins: 5,
            lockout_cooldown_minutes: 30,
            anomaly_threshold: 0.7,
            audit_logging_enabled: true,
        }
    }
}

#[derive(Default)]
struct Soc2State {
    failed_logins: HashMap<String, Vec<DateTime<Utc>>>,
    known_ips: HashMap<String, HashSet<String>>,
    request_log: HashMap<String, Vec<DateTime<Utc>>>,
}

/// SOC 2 access-control gate: MFA for sensitive actions, session timeout,
/// account lockout, anomaly scoring, change-management controls.
pub struct Soc2Gate {
    config: Soc2Config,
    state: RwLock<Soc2State>,
}

impl Soc2Gate {
    pub fn new(config: Soc2Config) -> Self {
        Self {
            config,
            state: RwLock::new(Soc2State::default()),
        }
    }

    pub fn record_failed_login(&self, actor: impl Into<String>) {
        self.state
            .write()
            .failed_logins
            .entry(actor.into())
            .or_default()
            .push(Utc::now());
    }

    /// Successful authentication clears the failure counter.
    pub fn record_successful_login(&self, actor: &str) {
        self.state.write().failed_logins.remove(actor);
    }

    pub fn observe_ip(&self, actor: impl Into<String>, ip: impl Into<String>) {
        self.state
            .write()
            .known_ips
            .entry(actor.into())
            .or_default()
            .insert(ip.into());
    }

    pub fn record_request(&self, actor: impl Into<String>, at: DateTime<Utc>) {
        self.state.write().request_log.entry(actor.into()).or_default().push(at);
    }

    fn is_locked_out(&self, actor: &str, now: DateTime<Utc>) -> Option<usize> {
        let state = self.state.read();
        let failures = state.failed_logins.get(actor)?;
        let cooldown = Duration::minutes(self.config.lockout_cooldown_minutes);
        let recent = failures.iter().filter(|at| now - **at < cooldown).count();
        (recent >= self.config.max_failed_logins).then_some(recent)
    }

    fn anomaly_score(&self, ctx: &ComplianceContext) -> (f64, Vec<&'static str>) {
        let mut score = 0.0;
        let mut signals = Vec::new();

        let hour = ctx.timestamp.hour();
        if !(6..22).contains(&hour) {
            score += 0.3;
            signals.push("off_hours");
        }

        if let Some(ip) = ctx.data_str("ip") {
            let known = self
                .state
                .read()
                .known_ips
                .get(&ctx.actor)
                .is_some_and(|ips| ips.contains(ip));
            if !known {
                score += 0.3;
                signals.push("new_ip");
            }
        }

        if ctx.data_str("resource_sensitivity") == Some("high") {
            score += 0.2;
            signals.push("sensitive_resource");
        }

        let recent = self
            .state
            .read()
            .request_log
            .get(&ctx.actor)
            .map(|log| {
                log.iter()
                    .filter(|at| ctx.timestamp - **at < Duration::minutes(1))
                    .count()
            })
            .unwrap_or(0);
        if recent > 10 {
            score += 0.2;
            signals.push("burst_rate");
        }

        let multiplier = ctx.data_f64("sensitivity_multiplier").unwrap_or(1.0);
        (score * multiplier, signals)
    }

    fn is_sensitive(&self, action: &str) -> bool {
        self.config
            .sensitive_actions
            .iter()
            .any(|pattern| wildcard(pattern, action))
    }
}

fn wildcard(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

impl ComplianceGate for Soc2Gate {
    fn id(&self) -> &str {
        "soc2"
    }

    fn regulation(&self) -> Regulation {
        Regulation::Soc2
    }

    fn priority(&self) -> i32 {
        30
    }

    fn check(&self, ctx: &ComplianceContext) -> CoreResult<GateCheckOutcome> {
        let mut violations = Vec::new();

        if !self.config.audit_logging_enabled {
            violations.push(
                Violation::new(
                    "SOC2-001",
                    Regulation::Soc2,
                    ViolationSeverity::Critical,
                    "audit logging is disabled".to_string(),
                )
                .with_rule("CC7.2")
                .with_remediation("re-enable audit logging before any gated action"),
            );
        }

        if self.is_sensitive(&ctx.action) && !ctx.data_bool("mfa_verified") {
            violations.push(
                Violation::new(
                    "SOC2-002",
                    Regulation::Soc2,
                    ViolationSeverity::Critical,
                    format!("sensitive action `{}` requires MFA", ctx.action),
                )
                .with_rule("CC6.1")
                .with_remediation("complete MFA before retrying"),
            );
        }

        if let Some(started) = ctx.data_f64("session_started_at") {
            let age_minutes = (ctx.timestamp.timestamp() as f64 - started) / 60.0;
            if age_minutes > self.config.session_timeout_minutes as f64 {
                violations.push(
                    Violation::new(
                        "SOC2-003",
                        Regulation::Soc2,
                        ViolationSeverity::High,
                        format!(
                            "session is {age_minutes:.0} minutes old; timeout is {} minutes",
                            self.config.session_timeout_minutes
                        ),
                    )
                    .with_rule("CC6.1")
                    .with_remediation("re-authenticate to start a fresh session"),
                );
            }
        }

        if let Some(failures) = self.is_locked_out(&ctx.actor, ctx.timestamp) {
            violations.push(
                Violation::new(
                    "SOC2-004",
                    Regulation::Soc2,
                    ViolationSeverity::Critical,
                    format!(
                        "account `{}` is locked after {failures} failed logins",
                        ctx.actor
                    ),
                )
                .with_rule("CC6.1")
                .with_remediation(format!(
                    "wait out the {}-minute cool-down or reset via support",
                    self.config.lockout_cooldown_minutes
                )),
            );
        }

        let (score, signals) = self.anomaly_score(ctx);
        if score >= self.config.anomaly_threshold {
            violations.push(
                Violation::new(
                    "SOC2-005",
                    Regulation::Soc2,
                    ViolationSeverity::High,
                    format!("anomaly score {score:.2} over threshold {:.2}", self.config.anomaly_threshold),
                )
                .with_rule("CC7.1")
                .with_evidence(json!({"score": score, "signals": signals}))
                .with_remediation("verify the actor's identity out of band"),
            );
        }

        if (ctx.action.starts_with("deploy") || ctx.action.starts_with("change"))
            && !(ctx.data_bool("change_approved") && ctx.data_bool("change_documented"))
        {
            violations.push(
                Violation::new(
                    "SOC2-006",
                    Regulation::Soc2,
                    ViolationSeverity::High,
                    "change lacks approval or documentation".to_string(),
                )
                .with_rule("CC8.1")
                .with_remediation("attach change approval and documentation records"),
            );
        }

        Ok(GateCheckOutcome::from_violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn daytime_ctx(action: &str) -> ComplianceContext {
        let mut ctx = ComplianceContext::new("alice", action);
        ctx.timestamp = Utc.with_ymd_and_hms(2025, 7, 15, 14, 0, 0).unwrap();
        ctx.data = json!({"mfa_verified": true, "ip": "10.0.0.1"});
        ctx
    }

    fn gate_with_known_ip() -> Soc2Gate {
        let gate = Soc2Gate::new(Soc2Config::default());
        gate.observe_ip("alice", "10.0.0.1");
        gate
    }

    #[test]
    fn sensitive_action_without_mfa_is_denied() {
        let gate = gate_with_known_ip();
        let mut ctx = daytime_ctx("delete_customer");
        ctx.data["mfa_verified"] = json!(false);
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "SOC2-002"));

        ctx.data["mfa_verified"] = json!(true);
        assert!(gate.check(&ctx).unwrap().allowed);
    }

    #[test]
    fn lockout_after_repeated_failures() {
        let gate = gate_with_known_ip();
        for _ in 0..5 {
            gate.record_failed_login("alice");
        }
        let mut ctx = daytime_ctx("read_report");
        ctx.timestamp = Utc::now();
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "SOC2-004"));

        gate.record_successful_login("alice");
        assert!(gate.check(&ctx).unwrap().allowed);
    }

    #[test]
    fn anomaly_signals_compound_to_a_denial() {
        let gate = Soc2Gate::new(Soc2Config::default());
        let mut ctx = ComplianceContext::new("alice", "read_report");
        // 03:00, unknown ip, sensitive resource: 0.3 + 0.3 + 0.2 = 0.8
        ctx.timestamp = Utc.with_ymd_and_hms(2025, 7, 15, 3, 0, 0).unwrap();
        ctx.data = json!({"ip": "203.0.113.9", "resource_sensitivity": "high"});
        let outcome = gate.check(&ctx).unwrap();
        let violation = outcome
            .violations
            .iter()
            .find(|v| v.code == "SOC2-005")
            .expect("anomaly violation");
        assert_eq!(violation.rule.as_deref(), Some("CC7.1"));
    }

    #[test]
    fn sensitivity_multiplier_scales_the_score() {
        let gate = gate_with_known_ip();
        // only off-hours (0.3), but a 3x multiplier crosses 0.7
        let mut ctx = ComplianceContext::new("alice", "read_report");
        ctx.timestamp = Utc.with_ymd_and_hms(2025, 7, 15, 3, 0, 0).unwrap();
        ctx.data = json!({"ip": "10.0.0.1", "sensitivity_multiplier": 3.0});
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "SOC2-005"));
    }

    #[test]
    fn stale_session_is_rejected() {
        let gate = gate_with_known_ip();
        let mut ctx = daytime_ctx("read_report");
        let started = ctx.timestamp.timestamp() - 45 * 60;
        ctx.data["session_started_at"] = json!(started);
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "SOC2-003"));
    }

    #[test]
    fn change_management_requires_approval_and_docs() {
        let gate = gate_with_known_ip();
        let mut ctx = daytime_ctx("deploy_api");
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "SOC2-006"));

        ctx.data["change_approved"] = json!(true);
        ctx.data["change_documented"] = json!(true);
        assert!(gate.check(&ctx).unwrap().allowed);
    }

    #[test]
    fn disabled_audit_logging_is_always_critical() {
        let gate = Soc2Gate::new(Soc2Config {
            audit_logging_enabled: false,
            ..Default::default()
        });
        let outcome = gate.check(&daytime_ctx("read_report")).unwrap();
        assert!(outcome
            .violations
            .iter()
            .any(|v| v.code == "SOC2-001" && v.severity == ViolationSeverity::Critical));
    }
}
