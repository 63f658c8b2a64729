use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tether_types::{CoreResult, Zone};

/// One audited action. Compliance checks write one of these whether they
/// pass or fail; the orchestrator writes them on run transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub verb: String,
    pub actor: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<Zone>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        verb: impl Into<String>,
        actor: impl Into<String>,
        target: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            verb: verb.into(),
            actor: actor.into(),
            target: target.into(),
            zone: None,
            success,
            duration_ms: None,
            metadata: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Where audit entries go. A sink failure can never silently allow a denied
/// action; callers treat `Err` as a deny.
pub trait AuditSink: Send + Sync {
    fn log_action(&self, entry: AuditEntry) -> CoreResult<()>;
}

/// Default sink: structured tracing records.
#[derive(Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_action(&self, entry: AuditEntry) -> CoreResult<()> {
        tracing::info!(
            target: "tether.audit",
            verb = %entry.verb,
            actor = %entry.actor,
            audit_target = %entry.target,
            zone = entry.zone.map(|z| z.as_str()).unwrap_or(""),
            success = entry.success,
            duration_ms = entry.duration_ms.unwrap_or(0),
            error = entry.error.as_deref().unwrap_or(""),
            "audit"
        );
        Ok(())
    }
}

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_action(&self, entry: AuditEntry) -> CoreResult<()> {
        self.entries.lock().push(entry);
        Ok(())
    }
}
