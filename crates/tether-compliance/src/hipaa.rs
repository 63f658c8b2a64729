use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tracing::info;

use tether_types::CoreResult;

use crate::context::{ComplianceContext, Regulation, Violation, ViolationSeverity};
use crate::framework::{ComplianceGate, GateCheckOutcome};

#[derive(Debug, Clone)]
pub struct PhiAuthorization {
    pub scope: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HipaaConfig {
    pub require_encryption: bool,
}

impl Default for HipaaConfig {
    fn default() -> Self {
        Self {
            require_encryption: true,
        }
    }
}

#[derive(Default)]
struct HipaaState {
    // (actor, patient) -> authorization
    authorizations: HashMap<(String, String), PhiAuthorization>,
    // purpose -> fields that satisfy minimum-necessary
    minimum_necessary: HashMap<String, HashSet<String>>,
}

/// HIPAA PHI-access gate: per-(actor, patient) authorization with scope and
/// expiry, minimum-necessary field sets, encryption flags, BAA for third
/// parties. Every PHI access is logged whether allowed or denied.
pub struct HipaaGate {
    config: HipaaConfig,
    state: RwLock<HipaaState>,
}

impl HipaaGate {
    pub fn new(config: HipaaConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HipaaState::default()),
        }
    }

    pub fn grant_authorization(
        &self,
        actor: impl Into<String>,
        patient: impl Into<String>,
        scope: Vec<String>,
        expires_at: DateTime<Utc>,
    ) {
        self.state.write().authorizations.insert(
            (actor.into(), patient.into()),
            PhiAuthorization { scope, expires_at },
        );
    }

    pub fn revoke_authorization(&self, actor: &str, patient: &str) {
        self.state
            .write()
            .authorizations
            .remove(&(actor.to_string(), patient.to_string()));
    }

    pub fn set_minimum_necessary(&self, purpose: impl Into<String>, fields: Vec<String>) {
        self.state
            .write()
            .minimum_necessary
            .insert(purpose.into(), fields.into_iter().collect());
    }
}

impl ComplianceGate for HipaaGate {
    fn id(&self) -> &str {
        "hipaa"
    }

    fn regulation(&self) -> Regulation {
        Regulation::Hipaa
    }

    fn priority(&self) -> i32 {
        70
    }

    fn check(&self, ctx: &ComplianceContext) -> CoreResult<GateCheckOutcome> {
        let patient = ctx
            .data_str("patient_id")
            .map(str::to_string)
            .or_else(|| ctx.target.id.clone());
        let Some(patient) = patient else {
            // no PHI subject in the request; nothing to gate
            return Ok(GateCheckOutcome::allow());
        };

        // PHI access is logged regardless of the decision
        info!(
            target: "tether.audit",
            actor = %ctx.actor,
            patient = %patient,
            action = %ctx.action,
            "phi_access"
        );

        let mut violations = Vec::new();

        let state = self.state.read();
        match state
            .authorizations
            .get(&(ctx.actor.clone(), patient.clone()))
        {
            Some(auth) if auth.expires_at <= ctx.timestamp => violations.push(
                Violation::new(
                    "HIPAA-001",
                    Regulation::Hipaa,
                    ViolationSeverity::Critical,
                    format!("authorization for `{}` on `{patient}` has expired", ctx.actor),
                )
                .with_rule("45 CFR 164.508")
                .with_remediation("obtain a fresh authorization from the patient"),
            ),
            Some(auth) if !auth.scope.iter().any(|s| s == &ctx.action) => violations.push(
                Violation::new(
                    "HIPAA-001",
                    Regulation::Hipaa,
                    ViolationSeverity::Critical,
                    format!(
                        "authorization scope {:?} does not cover `{}`",
                        auth.scope, ctx.action
                    ),
                )
                .with_rule("45 CFR 164.508")
                .with_remediation("request an authorization covering this action"),
            ),
            Some(_) => {}
            None => violations.push(
                Violation::new(
                    "HIPAA-001",
                    Regulation::Hipaa,
                    ViolationSeverity::Critical,
                    format!("no authorization for `{}` to access `{patient}`", ctx.actor),
                )
                .with_rule("45 CFR 164.508")
                .with_remediation("obtain patient authorization before access"),
            ),
        }

        if let Some(purpose) = ctx.data_str("purpose") {
            if let Some(allowed) = state.minimum_necessary.get(purpose) {
                let requested = ctx.data_str_list("requested_fields");
                let excessive: Vec<&String> =
                    requested.iter().filter(|f| !allowed.contains(*f)).collect();
                if !excessive.is_empty() {
                    violations.push(
                        Violation::new(
                            "HIPAA-002",
                            Regulation::Hipaa,
                            ViolationSeverity::High,
                            format!("fields {excessive:?} exceed minimum necessary for `{purpose}`"),
                        )
                        .with_rule("45 CFR 164.502(b)")
                        .with_evidence(json!({"requested": requested}))
                        .with_remediation("restrict the request to the minimum necessary fields"),
                    );
                }
            }
        }
        drop(state);

        if self.config.require_encryption
            && !(ctx.data_bool("encryption_at_rest") && ctx.data_bool("encryption_in_transit"))
        {
            violations.push(
                Violation::new(
                    "HIPAA-003",
                    Regulation::Hipaa,
                    ViolationSeverity::High,
                    "PHI path is not encrypted at rest and in transit".to_string(),
                )
                .with_rule("45 CFR 164.312")
                .with_remediation("enable encryption on the storage and transport path"),
            );
        }

        if ctx.data_bool("third_party") && !ctx.data_bool("baa_signed") {
            violations.push(
                Violation::new(
                    "HIPAA-004",
                    Regulation::Hipaa,
                    ViolationSeverity::Critical,
                    "third-party PHI access without a business associate agreement".to_string(),
                )
                .with_rule("45 CFR 164.308(b)")
                .with_remediation("execute a BAA with the third party first"),
            );
        }

        Ok(GateCheckOutcome::from_violations(violations))
    }
}
