use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use tether_types::CoreResult;

use crate::audit::{AuditEntry, AuditSink};
use crate::context::{ComplianceContext, Regulation, Violation, ViolationSeverity};

/// What a single gate concluded, before the framework stamps audit identity
/// and timing on it.
#[derive(Debug, Clone)]
pub struct GateCheckOutcome {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

impl GateCheckOutcome {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            violations: Vec::new(),
        }
    }

    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            allowed: violations.is_empty(),
            violations,
        }
    }
}

/// A registered compliance gate. Checks read the context and the gate's own
/// caches only; anything that mutates state (consent, opt-outs, DSRs) is a
/// separate explicit API on the concrete gate.
pub trait ComplianceGate: Send + Sync {
    fn id(&self) -> &str;
    fn regulation(&self) -> Regulation;
    fn priority(&self) -> i32 {
        0
    }
    fn check(&self, ctx: &ComplianceContext) -> CoreResult<GateCheckOutcome>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub gate_id: String,
    pub regulation: Regulation,
    pub allowed: bool,
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub audit_id: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub gates_run: usize,
    pub gates_passed: usize,
    pub gates_failed: usize,
    pub violation_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub overall_allowed: bool,
    pub results: Vec<GateDecision>,
    pub summary: ComplianceSummary,
}

impl ComplianceReport {
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.results.iter().flat_map(|r| r.violations.iter())
    }
}

/// Registry of compliance gates, run in descending priority. Fails closed:
/// a gate error, and an audit-sink error, both deny.
pub struct ComplianceFramework {
    gates: RwLock<Vec<Arc<dyn ComplianceGate>>>,
    audit: Arc<dyn AuditSink>,
}

impl ComplianceFramework {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            gates: RwLock::new(Vec::new()),
            audit,
        }
    }

    pub fn register(&self, gate: Arc<dyn ComplianceGate>) {
        self.gates.write().push(gate);
    }

    pub fn gate_ids(&self) -> Vec<String> {
        self.gates.read().iter().map(|g| g.id().to_string()).collect()
    }

    pub fn check_all(
        &self,
        ctx: &ComplianceContext,
        regulations: Option<&[Regulation]>,
    ) -> ComplianceReport {
        let mut applicable: Vec<Arc<dyn ComplianceGate>> = self
            .gates
            .read()
            .iter()
            .filter(|gate| {
                regulations
                    .map(|regs| regs.contains(&gate.regulation()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        applicable.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut results = Vec::with_capacity(applicable.len());
        for gate in applicable {
            results.push(self.run_gate(gate.as_ref(), ctx));
        }

        let gates_failed = results.iter().filter(|r| !r.allowed).count();
        let violation_count = results.iter().map(|r| r.violations.len()).sum();
        ComplianceReport {
            overall_allowed: gates_failed == 0,
            summary: ComplianceSummary {
                gates_run: results.len(),
                gates_passed: results.len() - gates_failed,
                gates_failed,
                violation_count,
            },
            results,
        }
    }

    fn run_gate(&self, gate: &dyn ComplianceGate, ctx: &ComplianceContext) -> GateDecision {
        let started = Instant::now();
        let audit_id = Uuid::new_v4().to_string();

        let outcome = match gate.check(ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(gate = gate.id(), error = %err, "compliance gate errored; failing closed");
                GateCheckOutcome {
                    allowed: false,
                    violations: vec![Violation::new(
                        "GATE-ERROR",
                        gate.regulation(),
                        ViolationSeverity::Critical,
                        format!("gate `{}` failed to evaluate: {err}", gate.id()),
                    )
                    .with_remediation("investigate the gate error before retrying")],
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut allowed = outcome.allowed;
        let mut violations = outcome.violations;

        let mut audit_entry = AuditEntry::new(
            format!("compliance.{}", gate.id()),
            ctx.actor.clone(),
            ctx.target
                .id
                .clone()
                .or_else(|| ctx.target.phone.clone())
                .or_else(|| ctx.target.email.clone())
                .unwrap_or_else(|| ctx.action.clone()),
            allowed,
        )
        .with_duration(duration_ms)
        .with_metadata(json!({
            "audit_id": audit_id,
            "action": ctx.action,
            "regulation": gate.regulation().as_str(),
            "violations": violations.iter().map(|v| v.code.clone()).collect::<Vec<_>>(),
        }));
        audit_entry.id = audit_id.clone();

        // an unauditable decision is a denied decision
        if let Err(err) = self.audit.log_action(audit_entry) {
            warn!(gate = gate.id(), error = %err, "audit sink failed; denying");
            allowed = false;
            violations.push(
                Violation::new(
                    "AUDIT-FAILED",
                    gate.regulation(),
                    ViolationSeverity::Critical,
                    format!("audit logging failed for gate `{}`: {err}", gate.id()),
                )
                .with_remediation("restore the audit sink; compliance checks fail closed without it"),
            );
        }

        let remediation = compose_remediation(&violations);
        GateDecision {
            gate_id: gate.id().to_string(),
            regulation: gate.regulation(),
            allowed,
            violations,
            remediation,
            audit_id,
            duration_ms,
        }
    }
}

fn compose_remediation(violations: &[Violation]) -> Option<String> {
    let parts: Vec<&str> = violations
        .iter()
        .filter_map(|v| v.remediation.as_deref())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}
