use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use tether_types::{CoreError, CoreResult};

/// Fields stripped from request payloads before fingerprinting. They change
/// on every legitimate retry and would defeat replay detection.
const VOLATILE_FIELDS: [&str; 4] = ["timestamp", "request_id", "trace_id", "nonce"];

const MAX_KEY_LENGTH: usize = 256;

/// Idempotency keys are caller-supplied; restrict them to a safe character
/// set before they reach hashing or storage paths.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(CoreError::Validation(format!(
            "idempotency key must be 1..={MAX_KEY_LENGTH} characters"
        )));
    }
    if let Some(bad) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | '/')))
    {
        return Err(CoreError::Validation(format!(
            "idempotency key contains invalid character `{bad}`"
        )));
    }
    Ok(())
}

/// sha-256 over `"{prefix}:{key}"`, hex.
pub fn hash_key(prefix: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    format!("{:064x}", hasher.finalize())
}

/// Recursive canonicalization: keys sorted and volatile fields stripped at
/// every object level, not just the top. A shallow sort would leave nested
/// key order (and nested volatile fields) in the digest.
pub fn canonicalize_request(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_FIELDS.contains(&k.as_str()))
                .collect();
            keys.sort();
            let mut out = Map::with_capacity(keys.len());
            for key in keys {
                out.insert(key.clone(), canonicalize_request(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_request).collect()),
        other => other.clone(),
    }
}

/// sha-256 over the canonical JSON, truncated to the first 32 hex chars.
pub fn request_fingerprint(request_data: &Value) -> String {
    let canonical = canonicalize_request(request_data);
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let digest = format!("{:064x}", hasher.finalize());
    digest[..32].to_string()
}
