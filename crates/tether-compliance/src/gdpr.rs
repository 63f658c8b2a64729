use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tether_types::CoreResult;

use crate::context::{ComplianceContext, Regulation, Violation, ViolationSeverity};
use crate::framework::{ComplianceGate, GateCheckOutcome};

const EU_EEA: [&str; 30] = [
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "IS", "LI", "NO",
];

const LAWFUL_BASES: [&str; 6] = [
    "consent",
    "contract",
    "legal_obligation",
    "vital_interests",
    "public_task",
    "legitimate_interests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DsrKind {
    Access,
    Rectification,
    Erasure,
    Restriction,
    Portability,
    Objection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DsrStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSubjectRequest {
    pub kind: DsrKind,
    pub status: DsrStatus,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ConsentRecord {
    purposes: Vec<String>,
    explicit: bool,
    #[allow(dead_code)]
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct GdprConfig {
    /// Countries with an EU adequacy decision.
    pub adequacy_countries: HashSet<String>,
    /// Destinations that are never acceptable.
    pub blocked_countries: HashSet<String>,
}

impl GdprConfig {
    pub fn standard() -> Self {
        Self {
            adequacy_countries: ["GB", "CH", "JP", "NZ", "CA", "KR", "IL", "AR", "UY"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            blocked_countries: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct GdprState {
    consents: HashMap<String, ConsentRecord>,
    dsrs: HashMap<String, Vec<DataSubjectRequest>>,
    // purpose -> fields that purpose may touch
    purpose_registry: HashMap<String, HashSet<String>>,
    // data category -> max retention days
    retention: HashMap<String, u64>,
}

/// GDPR processing gate: lawful basis, consent records, DSR blocking,
/// cross-border transfer rules, minimization, purpose limitation, retention.
pub struct GdprGate {
    config: GdprConfig,
    state: RwLock<GdprState>,
}

impl GdprGate {
    pub fn new(config: GdprConfig) -> Self {
        Self {
            config,
            state: RwLock::new(GdprState::default()),
        }
    }

    pub fn record_consent(&self, subject: impl Into<String>, purposes: Vec<String>, explicit: bool) {
        self.state.write().consents.insert(
            subject.into(),
            ConsentRecord {
                purposes,
                explicit,
                recorded_at: Utc::now(),
            },
        );
    }

    pub fn open_dsr(&self, subject: impl Into<String>, kind: DsrKind) {
        self.state.write().dsrs.entry(subject.into()).or_default().push(
            DataSubjectRequest {
                kind,
                status: DsrStatus::Pending,
                opened_at: Utc::now(),
            },
        );
    }

    pub fn resolve_dsr(&self, subject: &str, kind: DsrKind) {
        if let Some(requests) = self.state.write().dsrs.get_mut(subject) {
            for request in requests.iter_mut().filter(|r| r.kind == kind) {
                request.status = DsrStatus::Resolved;
            }
        }
    }

    pub fn register_purpose(&self, purpose: impl Into<String>, allowed_fields: Vec<String>) {
        self.state
            .write()
            .purpose_registry
            .insert(purpose.into(), allowed_fields.into_iter().collect());
    }

    pub fn set_retention(&self, category: impl Into<String>, days: u64) {
        self.state.write().retention.insert(category.into(), days);
    }

    fn blocking_dsr_open(&self, subject: &str) -> bool {
        self.state.read().dsrs.get(subject).is_some_and(|requests| {
            requests.iter().any(|r| {
                r.status == DsrStatus::Pending
                    && matches!(r.kind, DsrKind::Erasure | DsrKind::Restriction)
            })
        })
    }
}

impl ComplianceGate for GdprGate {
    fn id(&self) -> &str {
        "gdpr"
    }

    fn regulation(&self) -> Regulation {
        Regulation::Gdpr
    }

    fn priority(&self) -> i32 {
        60
    }

    fn check(&self, ctx: &ComplianceContext) -> CoreResult<GateCheckOutcome> {
        let subject = ctx
            .target
            .id
            .as_deref()
            .or(ctx.target.email.as_deref())
            .unwrap_or("");
        let mut violations = Vec::new();

        let basis = ctx.data_str("lawful_basis").unwrap_or("");
        if !LAWFUL_BASES.contains(&basis) {
            violations.push(
                Violation::new(
                    "GDPR-001",
                    Regulation::Gdpr,
                    ViolationSeverity::Critical,
                    format!("`{basis}` is not an enumerated lawful basis"),
                )
                .with_rule("Art. 6(1)")
                .with_remediation("declare one of the six Art. 6(1) lawful bases"),
            );
        }

        let purpose = ctx.data_str("purpose").unwrap_or("");
        if basis == "consent" {
            let state = self.state.read();
            match state.consents.get(subject) {
                Some(consent) => {
                    if !consent.purposes.iter().any(|p| p == purpose) {
                        violations.push(
                            Violation::new(
                                "GDPR-002",
                                Regulation::Gdpr,
                                ViolationSeverity::Critical,
                                format!("consent from `{subject}` does not cover purpose `{purpose}`"),
                            )
                            .with_rule("Art. 7")
                            .with_remediation("collect consent for this specific purpose"),
                        );
                    }
                    if ctx.data_bool("special_category") && !consent.explicit {
                        violations.push(
                            Violation::new(
                                "GDPR-002",
                                Regulation::Gdpr,
                                ViolationSeverity::Critical,
                                "special-category data requires explicit consent".to_string(),
                            )
                            .with_rule("Art. 9(2)(a)")
                            .with_remediation("obtain explicit consent for special-category data"),
                        );
                    }
                }
                None => violations.push(
                    Violation::new(
                        "GDPR-002",
                        Regulation::Gdpr,
                        ViolationSeverity::Critical,
                        format!("no consent record for subject `{subject}`"),
                    )
                    .with_rule("Art. 7")
                    .with_remediation("record the subject's consent before processing"),
                ),
            }
        }

        if self.blocking_dsr_open(subject) {
            violations.push(
                Violation::new(
                    "GDPR-003",
                    Regulation::Gdpr,
                    ViolationSeverity::Critical,
                    format!("a pending erasure/restriction request blocks processing for `{subject}`"),
                )
                .with_rule("Art. 17 / Art. 18")
                .with_remediation("resolve the open data-subject request first"),
            );
        }

        let destination = ctx
            .data_str("destination_country")
            .or(ctx.target.country.as_deref())
            .unwrap_or("")
            .to_uppercase();
        if !destination.is_empty() {
            if self.config.blocked_countries.contains(&destination) {
                violations.push(
                    Violation::new(
                        "GDPR-004",
                        Regulation::Gdpr,
                        ViolationSeverity::Critical,
                        format!("transfers to `{destination}` are blocked"),
                    )
                    .with_rule("Chapter V")
                    .with_remediation("do not transfer data to this destination"),
                );
            } else if !EU_EEA.contains(&destination.as_str())
                && !self.config.adequacy_countries.contains(&destination)
                && !ctx.data_bool("scc_or_bcr")
            {
                violations.push(
                    Violation::new(
                        "GDPR-005",
                        Regulation::Gdpr,
                        ViolationSeverity::High,
                        format!(
                            "transfer to `{destination}` needs SCC or BCR safeguards on record"
                        ),
                    )
                    .with_rule("Art. 46")
                    .with_remediation("put Standard Contractual Clauses or BCRs in place"),
                );
            }
        }

        let requested = ctx.data_str_list("requested_fields");
        if !purpose.is_empty() {
            let state = self.state.read();
            match state.purpose_registry.get(purpose) {
                Some(allowed) => {
                    let excessive: Vec<&String> =
                        requested.iter().filter(|f| !allowed.contains(*f)).collect();
                    if !excessive.is_empty() {
                        violations.push(
                            Violation::new(
                                "GDPR-006",
                                Regulation::Gdpr,
                                ViolationSeverity::High,
                                format!(
                                    "fields {excessive:?} exceed what purpose `{purpose}` needs"
                                ),
                            )
                            .with_rule("Art. 5(1)(c)")
                            .with_evidence(json!({"requested": requested, "purpose": purpose}))
                            .with_remediation("request only the fields the purpose requires"),
                        );
                    }
                }
                None => violations.push(
                    Violation::new(
                        "GDPR-007",
                        Regulation::Gdpr,
                        ViolationSeverity::High,
                        format!("purpose `{purpose}` is not in the processing registry"),
                    )
                    .with_rule("Art. 5(1)(b)")
                    .with_remediation("register the purpose before processing under it"),
                ),
            }
        }

        if let (Some(category), Some(days)) = (
            ctx.data_str("data_category"),
            ctx.data_f64("retention_days"),
        ) {
            let state = self.state.read();
            if let Some(max_days) = state.retention.get(category) {
                if days > *max_days as f64 {
                    violations.push(
                        Violation::new(
                            "GDPR-008",
                            Regulation::Gdpr,
                            ViolationSeverity::Medium,
                            format!(
                                "retention of {days} days exceeds the {max_days}-day limit for `{category}`"
                            ),
                        )
                        .with_rule("Art. 5(1)(e)")
                        .with_remediation("shorten retention to the category limit"),
                    );
                }
            }
        }

        Ok(GateCheckOutcome::from_violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing_ctx() -> ComplianceContext {
        let mut ctx = ComplianceContext::new("crm", "process_profile");
        ctx.target.id = Some("subject-1".to_string());
        ctx.data = json!({
            "lawful_basis": "consent",
            "purpose": "marketing",
            "requested_fields": ["email", "name"],
        });
        ctx
    }

    fn consenting_gate() -> GdprGate {
        let gate = GdprGate::new(GdprConfig::standard());
        gate.record_consent("subject-1", vec!["marketing".to_string()], true);
        gate.register_purpose(
            "marketing",
            vec!["email".to_string(), "name".to_string()],
        );
        gate
    }

    #[test]
    fn consented_registered_processing_passes() {
        let gate = consenting_gate();
        let outcome = gate.check(&processing_ctx()).unwrap();
        assert!(outcome.allowed, "violations: {:?}", outcome.violations);
    }

    #[test]
    fn unknown_lawful_basis_is_critical() {
        let gate = consenting_gate();
        let mut ctx = processing_ctx();
        ctx.data["lawful_basis"] = json!("because_we_want_to");
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome
            .violations
            .iter()
            .any(|v| v.code == "GDPR-001" && v.rule.as_deref() == Some("Art. 6(1)")));
    }

    #[test]
    fn pending_erasure_blocks_processing() {
        let gate = consenting_gate();
        gate.open_dsr("subject-1", DsrKind::Erasure);
        let outcome = gate.check(&processing_ctx()).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "GDPR-003"));

        gate.resolve_dsr("subject-1", DsrKind::Erasure);
        assert!(gate.check(&processing_ctx()).unwrap().allowed);
    }

    #[test]
    fn access_dsr_does_not_block() {
        let gate = consenting_gate();
        gate.open_dsr("subject-1", DsrKind::Access);
        assert!(gate.check(&processing_ctx()).unwrap().allowed);
    }

    #[test]
    fn cross_border_rules_by_destination() {
        let gate = consenting_gate();

        let mut eu = processing_ctx();
        eu.data["destination_country"] = json!("DE");
        assert!(gate.check(&eu).unwrap().allowed);

        let mut adequacy = processing_ctx();
        adequacy.data["destination_country"] = json!("JP");
        assert!(gate.check(&adequacy).unwrap().allowed);

        let mut bare = processing_ctx();
        bare.data["destination_country"] = json!("US");
        assert!(gate
            .check(&bare)
            .unwrap()
            .violations
            .iter()
            .any(|v| v.code == "GDPR-005"));

        let mut safeguarded = processing_ctx();
        safeguarded.data["destination_country"] = json!("US");
        safeguarded.data["scc_or_bcr"] = json!(true);
        assert!(gate.check(&safeguarded).unwrap().allowed);
    }

    #[test]
    fn blocked_country_is_rejected_outright() {
        let mut config = GdprConfig::standard();
        config.blocked_countries.insert("KP".to_string());
        let gate = GdprGate::new(config);
        gate.record_consent("subject-1", vec!["marketing".to_string()], true);
        gate.register_purpose("marketing", vec!["email".to_string(), "name".to_string()]);

        let mut ctx = processing_ctx();
        ctx.data["destination_country"] = json!("KP");
        ctx.data["scc_or_bcr"] = json!(true);
        assert!(gate
            .check(&ctx)
            .unwrap()
            .violations
            .iter()
            .any(|v| v.code == "GDPR-004"));
    }

    #[test]
    fn minimization_and_purpose_limitation() {
        let gate = consenting_gate();

        let mut greedy = processing_ctx();
        greedy.data["requested_fields"] = json!(["email", "name", "ssn"]);
        assert!(gate
            .check(&greedy)
            .unwrap()
            .violations
            .iter()
            .any(|v| v.code == "GDPR-006"));

        let gate = GdprGate::new(GdprConfig::standard());
        gate.record_consent("subject-1", vec!["analytics".to_string()], true);
        let mut unregistered = processing_ctx();
        unregistered.data["purpose"] = json!("analytics");
        assert!(gate
            .check(&unregistered)
            .unwrap()
            .violations
            .iter()
            .any(|v| v.code == "GDPR-007"));
    }

    #[test]
    fn retention_over_category_limit_is_flagged() {
        let gate = consenting_gate();
        gate.set_retention("behavioral", 90);
        let mut ctx = processing_ctx();
        ctx.data["data_category"] = json!("behavioral");
        ctx.data["retention_days"] = json!(365);
        assert!(gate
            .check(&ctx)
            .unwrap()
            .violations
            .iter()
            .any(|v| v.code == "GDPR-008"));
    }

    #[test]
    fn special_category_needs_explicit_consent() {
        let gate = GdprGate::new(GdprConfig::standard());
        gate.record_consent("subject-1", vec!["marketing".to_string()], false);
        gate.register_purpose("marketing", vec!["email".to_string(), "name".to_string()]);
        let mut ctx = processing_ctx();
        ctx.data["special_category"] = json!(true);
        assert!(gate
            .check(&ctx)
            .unwrap()
            .violations
            .iter()
            .any(|v| v.code == "GDPR-002" && v.rule.as_deref() == Some("Art. 9(2)(a)")));
    }
}
