use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event published on the runtime event bus. Consumers subscribe through the
/// bus; the core never blocks on delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: String,
    pub event_type: String,
    pub properties: Value,
    pub created_at: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            properties,
            created_at: Utc::now(),
        }
    }
}
