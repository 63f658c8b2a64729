use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Locked,
    Completed,
    Failed,
    Expired,
}

/// Ledger record for one idempotency key. `version` backs optimistic
/// locking: every update bumps it and must name the version it read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: String,
    pub key_hash: String,
    pub namespace: String,
    pub status: IdempotencyStatus,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
}

impl IdempotencyRecord {
    pub fn new(
        namespace: impl Into<String>,
        key_hash: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            key_hash: key_hash.into(),
            namespace: namespace.into(),
            status: IdempotencyStatus::Pending,
            metadata: Value::Null,
            result: None,
            error: None,
            lock_id: None,
            lock_expires_at: None,
            created_at: now,
            updated_at: now,
            expires_at,
            attempts: 0,
            version: 1,
            fingerprint: None,
            actor: None,
            processing_duration_ms: None,
        }
    }

    pub fn lock_is_live(&self, now: DateTime<Utc>) -> bool {
        self.lock_id.is_some() && self.lock_expires_at.is_some_and(|expiry| expiry > now)
    }
}
