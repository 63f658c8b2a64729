use chrono::Utc;
use serde_json::{json, Value};

use crate::replay::EventIdStore;
use crate::signature::{
    constant_time_eq, compute_hmac, HmacAlgorithm, TimestampWindow,
};
use crate::verifier::{error_codes, Verification, WebhookRequest, WebhookVerifier};

const PROVIDER: &str = "stripe";
const SIGNATURE_HEADER: &str = "stripe-signature";

pub struct StripeVerifier {
    secret: String,
    window: TimestampWindow,
    events: EventIdStore,
}

impl StripeVerifier {
    pub fn new(secret: impl Into<String>, tolerance_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            window: TimestampWindow::new(tolerance_seconds),
            events: EventIdStore::new(24 * 60 * 60),
        }
    }

    pub fn with_event_ttl(secret: impl Into<String>, tolerance_seconds: i64, event_ttl_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            window: TimestampWindow::new(tolerance_seconds),
            events: EventIdStore::new(event_ttl_seconds),
        }
    }

    /// The exact bytes Stripe signs: `{timestamp}.{body}`.
    pub fn signed_payload(timestamp: i64, body: &str) -> String {
        format!("{timestamp}.{body}")
    }

    pub fn expected_signature(&self, timestamp: i64, body: &str) -> String {
        hex::encode(compute_hmac(
            HmacAlgorithm::Sha256,
            self.secret.as_bytes(),
            Self::signed_payload(timestamp, body).as_bytes(),
        ))
    }
}

/// Parse `t=...,v1=...,v1=...` into the timestamp and all v1 candidates.
fn parse_signature_header(header: &str) -> (Option<i64>, Vec<String>) {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => candidates.push(value.to_string()),
            _ => {}
        }
    }
    (timestamp, candidates)
}

impl WebhookVerifier for StripeVerifier {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn verify(&self, request: &WebhookRequest) -> Verification {
        let Some(header) = request.header(SIGNATURE_HEADER) else {
            return Verification::fail(
                PROVIDER,
                error_codes::MISSING_SIGNATURE,
                format!("missing `{SIGNATURE_HEADER}` header"),
            );
        };

        let (timestamp, candidates) = parse_signature_header(header);
        let Some(timestamp) = timestamp else {
            return Verification::fail(
                PROVIDER,
                error_codes::MISSING_TIMESTAMP,
                "signature header carries no `t=` element",
            );
        };
        if candidates.is_empty() {
            return Verification::fail(
                PROVIDER,
                error_codes::MISSING_SIGNATURE,
                "signature header carries no `v1=` element",
            );
        }

        if let Err(reason) = self.window.validate(timestamp, Utc::now().timestamp()) {
            return Verification::fail(PROVIDER, error_codes::TIMESTAMP_OUT_OF_RANGE, reason);
        }

        // any matching v1 passes (Stripe rolls secrets by sending several)
        let expected = self.expected_signature(timestamp, &request.body);
        let matched = candidates
            .iter()
            .any(|candidate| constant_time_eq(expected.as_bytes(), candidate.as_bytes()));
        if !matched {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_SIGNATURE,
                "no v1 signature matches the payload",
            );
        }

        let event = request.json_body();
        let event_id = event
            .as_ref()
            .and_then(|e| e.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut verification = Verification::ok(PROVIDER, event);
        if let Some(event_id) = event_id {
            let first_time = self.events.first_time(&event_id);
            verification = verification.with_metadata(json!({
                "event_id": event_id,
                "duplicate": !first_time,
            }));
            if !first_time {
                // duplicates stay valid but are flagged for the caller
                verification = verification.with_flag(
                    error_codes::REPLAY_DETECTED,
                    format!("event `{event_id}` was already processed"),
                );
            }
        }
        verification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn signed_request(verifier: &StripeVerifier, timestamp: i64, body: &str) -> WebhookRequest {
        let signature = verifier.expected_signature(timestamp, body);
        WebhookRequest::new("https://example.com/webhooks/stripe", body)
            .with_header(SIGNATURE_HEADER, format!("t={timestamp},v1={signature}"))
    }

    #[test]
    fn valid_signature_passes_and_event_parses() {
        let verifier = StripeVerifier::new(SECRET, 24 * 60 * 60);
        let body = r#"{"id": "evt_1", "type": "payment_intent.succeeded"}"#;
        let request = signed_request(&verifier, Utc::now().timestamp(), body);

        let verification = verifier.verify(&request);
        assert!(verification.valid);
        assert!(verification.error_code.is_none());
        assert_eq!(
            verification.event.unwrap()["type"],
            json!("payment_intent.succeeded")
        );
    }

    #[test]
    fn duplicate_event_id_is_valid_but_flagged() {
        let verifier = StripeVerifier::new(SECRET, 24 * 60 * 60);
        let body = r#"{"id": "evt_dup", "type": "invoice.paid"}"#;
        let request = signed_request(&verifier, Utc::now().timestamp(), body);

        let first = verifier.verify(&request);
        assert!(first.valid);
        assert_eq!(first.metadata["duplicate"], json!(false));

        let second = verifier.verify(&request);
        assert!(second.valid);
        assert_eq!(
            second.error_code.as_deref(),
            Some(error_codes::REPLAY_DETECTED)
        );
        assert_eq!(second.metadata["duplicate"], json!(true));
    }

    #[test]
    fn event_id_passes_again_after_ttl() {
        let verifier = StripeVerifier::with_event_ttl(SECRET, 24 * 60 * 60, 0);
        let body = r#"{"id": "evt_ttl", "type": "invoice.paid"}"#;
        let request = signed_request(&verifier, Utc::now().timestamp(), body);

        assert!(verifier.verify(&request).error_code.is_none());
        // zero TTL: the id has already aged out
        assert!(verifier.verify(&request).error_code.is_none());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let verifier = StripeVerifier::new(SECRET, 300);
        let body = r#"{"id": "evt_old"}"#;
        let request = signed_request(&verifier, Utc::now().timestamp() - 3_600, body);

        let verification = verifier.verify(&request);
        assert!(!verification.valid);
        assert_eq!(
            verification.error_code.as_deref(),
            Some(error_codes::TIMESTAMP_OUT_OF_RANGE)
        );
    }

    #[test]
    fn any_matching_v1_among_several_passes() {
        let verifier = StripeVerifier::new(SECRET, 24 * 60 * 60);
        let body = r#"{"id": "evt_multi"}"#;
        let timestamp = Utc::now().timestamp();
        let good = verifier.expected_signature(timestamp, body);
        let request = WebhookRequest::new("https://example.com/webhooks/stripe", body)
            .with_header(
                SIGNATURE_HEADER,
                format!("t={timestamp},v1={},v1={good}", "0".repeat(64)),
            );
        assert!(verifier.verify(&request).valid);
    }

    #[test]
    fn wrong_secret_fails() {
        let verifier = StripeVerifier::new(SECRET, 24 * 60 * 60);
        let other = StripeVerifier::new("whsec_other", 24 * 60 * 60);
        let body = r#"{"id": "evt_bad"}"#;
        let request = signed_request(&other, Utc::now().timestamp(), body);

        let verification = verifier.verify(&request);
        assert!(!verification.valid);
        assert_eq!(
            verification.error_code.as_deref(),
            Some(error_codes::INVALID_SIGNATURE)
        );
    }
}
