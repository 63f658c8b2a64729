use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::json;

use crate::replay::ReplayStore;
use crate::signature::{
    compute_hmac, constant_time_eq, encode_signature, HmacAlgorithm, SignatureEncoding,
    TimestampWindow,
};
use crate::verifier::{error_codes, Verification, WebhookRequest, WebhookVerifier};

const PROVIDER: &str = "sinch";
const SIGNATURE_HEADER: &str = "x-sinch-webhook-signature";
const NONCE_HEADER: &str = "x-sinch-webhook-signature-nonce";
const TIMESTAMP_HEADER: &str = "x-sinch-webhook-signature-timestamp";

#[derive(Debug, Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Sinch routes by request shape: Conversation API requests carry HMAC
/// signature headers, SMS and Voice use Basic auth and are told apart by
/// their body shape.
pub struct SinchVerifier {
    sms: Option<BasicCredentials>,
    voice: Option<BasicCredentials>,
    conversation_secret: Option<String>,
    window: TimestampWindow,
    replay: ReplayStore,
}

impl SinchVerifier {
    pub fn new(
        sms: Option<BasicCredentials>,
        voice: Option<BasicCredentials>,
        conversation_secret: Option<String>,
        max_age_seconds: i64,
    ) -> Self {
        Self {
            sms,
            voice,
            conversation_secret,
            window: TimestampWindow::new(max_age_seconds),
            replay: ReplayStore::new(max_age_seconds),
        }
    }

    /// Conversation API signs `nonce.timestamp.body` with HMAC-SHA256/base64.
    pub fn conversation_signature(secret: &str, nonce: &str, timestamp: &str, body: &str) -> String {
        let signed = format!("{nonce}.{timestamp}.{body}");
        encode_signature(
            &compute_hmac(HmacAlgorithm::Sha256, secret.as_bytes(), signed.as_bytes()),
            SignatureEncoding::Base64,
        )
    }

    fn verify_conversation(&self, request: &WebhookRequest) -> Verification {
        let Some(secret) = self.conversation_secret.as_deref() else {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_AUTH,
                "no conversation secret configured",
            );
        };
        let (Some(signature), Some(nonce), Some(timestamp)) = (
            request.header(SIGNATURE_HEADER),
            request.header(NONCE_HEADER),
            request.header(TIMESTAMP_HEADER),
        ) else {
            return Verification::fail(
                PROVIDER,
                error_codes::MISSING_SIGNATURE,
                "conversation requests need signature, nonce, and timestamp headers",
            );
        };

        if let Ok(ts) = timestamp.parse::<i64>() {
            if let Err(reason) = self.window.validate(ts, Utc::now().timestamp()) {
                return Verification::fail(PROVIDER, error_codes::TIMESTAMP_OUT_OF_RANGE, reason);
            }
        } else {
            return Verification::fail(
                PROVIDER,
                error_codes::MISSING_TIMESTAMP,
                "timestamp header is not an integer",
            );
        }

        let expected = Self::conversation_signature(secret, nonce, timestamp, &request.body);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_SIGNATURE,
                "conversation signature mismatch",
            );
        }

        if !self.replay.check_and_record(signature) {
            return Verification::fail(
                PROVIDER,
                error_codes::REPLAY_DETECTED,
                "conversation signature replayed inside the window",
            );
        }

        Verification::ok(PROVIDER, request.json_body())
            .with_metadata(json!({"channel": "conversation"}))
    }

    fn verify_basic(&self, request: &WebhookRequest) -> Verification {
        let Some(auth) = request.header("authorization") else {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_AUTH,
                "missing authorization header",
            );
        };
        let Some(encoded) = auth.strip_prefix("Basic ") else {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_AUTH,
                "authorization is not Basic",
            );
        };
        let decoded = match BASE64.decode(encoded) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(_) => {
                return Verification::fail(
                    PROVIDER,
                    error_codes::INVALID_AUTH,
                    "authorization is not valid base64",
                )
            }
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_AUTH,
                "authorization lacks `user:pass` shape",
            );
        };

        // voice events carry an `event` field; everything else is SMS
        let body = request.json_body();
        let is_voice = body
            .as_ref()
            .is_some_and(|b| b.get("event").is_some());
        let (channel, creds) = if is_voice {
            ("voice", self.voice.as_ref())
        } else {
            ("sms", self.sms.as_ref())
        };

        let Some(creds) = creds else {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_AUTH,
                format!("no credentials configured for the {channel} channel"),
            );
        };
        let user_ok = constant_time_eq(creds.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(creds.password.as_bytes(), password.as_bytes());
        if !(user_ok && pass_ok) {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_AUTH,
                format!("bad credentials for the {channel} channel"),
            );
        }

        Verification::ok(PROVIDER, body).with_metadata(json!({"channel": channel}))
    }
}

impl WebhookVerifier for SinchVerifier {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn verify(&self, request: &WebhookRequest) -> Verification {
        if request.header(SIGNATURE_HEADER).is_some() {
            self.verify_conversation(request)
        } else {
            self.verify_basic(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> SinchVerifier {
        SinchVerifier::new(
            Some(BasicCredentials {
                username: "sms-user".to_string(),
                password: "sms-pass".to_string(),
            }),
            Some(BasicCredentials {
                username: "voice-user".to_string(),
                password: "voice-pass".to_string(),
            }),
            Some("conversation-secret".to_string()),
            300,
        )
    }

    fn basic_header(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn conversation_signature_verifies_and_rejects_replay() {
        let verifier = verifier();
        let body = r#"{"message": {"text": "hi"}}"#;
        let nonce = "abc123";
        let timestamp = Utc::now().timestamp().to_string();
        let signature = SinchVerifier::conversation_signature(
            "conversation-secret",
            nonce,
            &timestamp,
            body,
        );
        let request = WebhookRequest::new("https://example.com/webhooks/sinch", body)
            .with_header(SIGNATURE_HEADER, signature)
            .with_header(NONCE_HEADER, nonce)
            .with_header(TIMESTAMP_HEADER, &timestamp);

        let first = verifier.verify(&request);
        assert!(first.valid);
        assert_eq!(first.metadata["channel"], json!("conversation"));

        let second = verifier.verify(&request);
        assert!(!second.valid);
        assert_eq!(
            second.error_code.as_deref(),
            Some(error_codes::REPLAY_DETECTED)
        );
    }

    #[test]
    fn sms_and_voice_route_by_body_shape() {
        let verifier = verifier();

        let sms = WebhookRequest::new("u", r#"{"type": "mo_text", "body": "hello"}"#)
            .with_header("authorization", basic_header("sms-user", "sms-pass"));
        let verification = verifier.verify(&sms);
        assert!(verification.valid);
        assert_eq!(verification.metadata["channel"], json!("sms"));

        let voice = WebhookRequest::new("u", r#"{"event": "ice", "callid": "c1"}"#)
            .with_header("authorization", basic_header("voice-user", "voice-pass"));
        let verification = verifier.verify(&voice);
        assert!(verification.valid);
        assert_eq!(verification.metadata["channel"], json!("voice"));
    }

    #[test]
    fn wrong_basic_credentials_fail() {
        let verifier = verifier();
        let request = WebhookRequest::new("u", r#"{"type": "mo_text"}"#)
            .with_header("authorization", basic_header("sms-user", "wrong"));
        let verification = verifier.verify(&request);
        assert!(!verification.valid);
        assert_eq!(
            verification.error_code.as_deref(),
            Some(error_codes::INVALID_AUTH)
        );
    }

    #[test]
    fn voice_credentials_do_not_open_the_sms_channel() {
        let verifier = verifier();
        let request = WebhookRequest::new("u", r#"{"type": "mo_text"}"#)
            .with_header("authorization", basic_header("voice-user", "voice-pass"));
        assert!(!verifier.verify(&request).valid);
    }

    #[test]
    fn stale_conversation_timestamp_is_rejected() {
        let verifier = verifier();
        let body = "{}";
        let nonce = "n1";
        let timestamp = (Utc::now().timestamp() - 3_600).to_string();
        let signature = SinchVerifier::conversation_signature(
            "conversation-secret",
            nonce,
            &timestamp,
            body,
        );
        let request = WebhookRequest::new("u", body)
            .with_header(SIGNATURE_HEADER, signature)
            .with_header(NONCE_HEADER, nonce)
            .with_header(TIMESTAMP_HEADER, &timestamp);
        assert_eq!(
            verifier.verify(&request).error_code.as_deref(),
            Some(error_codes::TIMESTAMP_OUT_OF_RANGE)
        );
    }
}
