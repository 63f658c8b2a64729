use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod error_codes {
    pub const MISSING_SIGNATURE: &str = "MISSING_SIGNATURE";
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
    pub const MISSING_TIMESTAMP: &str = "MISSING_TIMESTAMP";
    pub const TIMESTAMP_OUT_OF_RANGE: &str = "TIMESTAMP_OUT_OF_RANGE";
    pub const REPLAY_DETECTED: &str = "REPLAY_DETECTED";
    pub const INVALID_AUTH: &str = "INVALID_AUTH";
    pub const URL_MISMATCH: &str = "URL_MISMATCH";
    pub const MALFORMED_PAYLOAD: &str = "MALFORMED_PAYLOAD";
    pub const NO_ROUTE: &str = "NO_ROUTE";
}

/// An already-received webhook request. Transport is someone else's job;
/// header names are stored lowercase.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Decoded form parameters for form-encoded posts (Twilio signs these).
    pub params: BTreeMap<String, String>,
}

impl WebhookRequest {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: body.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub valid: bool,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl Verification {
    pub fn ok(provider: impl Into<String>, event: Option<Value>) -> Self {
        Self {
            valid: true,
            provider: provider.into(),
            error: None,
            error_code: None,
            event,
            metadata: Value::Null,
        }
    }

    pub fn fail(
        provider: impl Into<String>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            valid: false,
            provider: provider.into(),
            error: Some(message.into()),
            error_code: Some(code.to_string()),
            event: None,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Flag a condition (e.g. a duplicate event id) without invalidating.
    pub fn with_flag(mut self, code: &str, message: impl Into<String>) -> Self {
        self.error_code = Some(code.to_string());
        self.error = Some(message.into());
        self
    }
}

/// Per-provider signature verification over a received request.
pub trait WebhookVerifier: Send + Sync {
    fn provider(&self) -> &str;
    fn verify(&self, request: &WebhookRequest) -> Verification;
}
