use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regulation {
    #[serde(rename = "TCPA")]
    Tcpa,
    #[serde(rename = "CTIA")]
    Ctia,
    #[serde(rename = "GDPR")]
    Gdpr,
    #[serde(rename = "SOC2")]
    Soc2,
    #[serde(rename = "HIPAA")]
    Hipaa,
}

impl Regulation {
    pub fn as_str(self) -> &'static str {
        match self {
            Regulation::Tcpa => "TCPA",
            Regulation::Ctia => "CTIA",
            Regulation::Gdpr => "GDPR",
            Regulation::Soc2 => "SOC2",
            Regulation::Hipaa => "HIPAA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Who or what a compliance-gated action is directed at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplianceTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceContext {
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub target: ComplianceTarget,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl ComplianceContext {
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            target: ComplianceTarget::default(),
            timestamp: Utc::now(),
            data: Value::Null,
        }
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_bool(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn data_str_list(&self, key: &str) -> Vec<String> {
        self.data
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One concrete rule breach, tagged with the regulation and, where known,
/// the specific rule reference and monetary exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub regulation: Regulation,
    pub severity: ViolationSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub evidence: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Violation {
    pub fn new(
        code: impl Into<String>,
        regulation: Regulation,
        severity: ViolationSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            regulation,
            severity,
            rule: None,
            message: message.into(),
            timestamp: Utc::now(),
            evidence: Value::Null,
            exposure_usd: None,
            remediation: None,
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_evidence(mut self, evidence: Value) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_exposure(mut self, usd: f64) -> Self {
        self.exposure_usd = Some(usd);
        self
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}
