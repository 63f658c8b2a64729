use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditVerb {
    Create,
    Supersede,
    Delete,
    Rollback,
}

/// Audit record parallel to a state entry, keyed by its own id and
/// referencing the entry it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateAuditRecord {
    pub id: String,
    pub entry_id: String,
    pub verb: AuditVerb,
    pub key: String,
    pub environment: String,
    pub actor: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StateAuditRecord {
    pub fn new(
        verb: AuditVerb,
        entry_id: impl Into<String>,
        key: impl Into<String>,
        environment: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entry_id: entry_id.into(),
            verb,
            key: key.into(),
            environment: environment.into(),
            actor: actor.into(),
            at: Utc::now(),
            details: None,
        }
    }
}
