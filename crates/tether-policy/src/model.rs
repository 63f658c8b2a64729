use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tether_types::{Condition, ConditionExpr, Zone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMeta {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub status: PolicyStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyMeta {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            version: 1,
            status: PolicyStatus::Active,
            priority,
            created_at: now,
            updated_at: now,
        }
    }
}

/// When a gate runs: against the incoming request, or against an output
/// via the quality-gate executor. Request evaluation skips output gates —
/// their conditions read fields that only exist on the output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    #[default]
    Request,
    Output,
}

/// Zone applicability for a gate: a single zone, or every zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ZoneScope {
    #[default]
    All,
    Green,
    Yellow,
    Red,
}

impl ZoneScope {
    pub fn applies_to(self, zone: Zone) -> bool {
        match self {
            ZoneScope::All => true,
            ZoneScope::Green => zone == Zone::Green,
            ZoneScope::Yellow => zone == Zone::Yellow,
            ZoneScope::Red => zone == Zone::Red,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheck {
    pub name: String,
    pub condition: ConditionExpr,
    pub severity: Severity,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Handler-specific parameters (length bounds, budgets, patterns).
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(flatten)]
    pub meta: PolicyMeta,
    #[serde(default)]
    pub zone: ZoneScope,
    #[serde(default)]
    pub stage: GateStage,
    pub checks: Vec<GateCheck>,
}

/// A trigger fires when all of its conditions match the request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillswitchTrigger {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillswitchPolicy {
    #[serde(flatten)]
    pub meta: PolicyMeta,
    /// Wildcard pattern over the request action; unset matches everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub triggers: Vec<KillswitchTrigger>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub duration_seconds: u64,
    pub max_requests: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(flatten)]
    pub meta: PolicyMeta,
    /// Wildcard pattern over the request resource.
    pub resource: String,
    pub windows: Vec<RateLimitWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    Gate(GatePolicy),
    Killswitch(KillswitchPolicy),
    RateLimit(RateLimitPolicy),
}

impl Policy {
    pub fn meta(&self) -> &PolicyMeta {
        match self {
            Policy::Gate(p) => &p.meta,
            Policy::Killswitch(p) => &p.meta,
            Policy::RateLimit(p) => &p.meta,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Policy::Gate(_) => "gate",
            Policy::Killswitch(_) => "killswitch",
            Policy::RateLimit(_) => "rate_limit",
        }
    }
}

/// Wildcard match with `*` segments, anchored at both ends.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            is_first = false;
            continue;
        }
        if is_first {
            if let Some(stripped) = remaining.strip_prefix(part) {
                remaining = stripped;
            } else {
                return false;
            }
            is_first = false;
            continue;
        }
        if let Some(index) = remaining.find(part) {
            remaining = &remaining[index + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}
