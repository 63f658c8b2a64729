use serde_json::{json, Value};
use url::Url;

use crate::signature::{
    compute_hmac, constant_time_eq, encode_signature, HmacAlgorithm, SignatureEncoding,
};
use crate::verifier::{error_codes, Verification, WebhookRequest, WebhookVerifier};

const PROVIDER: &str = "twilio";
const SIGNATURE_HEADER: &str = "x-twilio-signature";

pub struct TwilioVerifier {
    auth_token: String,
    /// Configured webhook URL; expands relative request paths. An absolute
    /// request URL is authoritative over this.
    webhook_url: Option<String>,
}

impl TwilioVerifier {
    pub fn new(auth_token: impl Into<String>, webhook_url: Option<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            webhook_url,
        }
    }

    /// Twilio signs `url` followed by every POST parameter's key and value,
    /// sorted by key, then HMAC-SHA1 base64 over the concatenation.
    pub fn expected_signature(&self, url: &str, params: &std::collections::BTreeMap<String, String>) -> String {
        let mut data = url.to_string();
        for (key, value) in params {
            data.push_str(key);
            data.push_str(value);
        }
        encode_signature(
            &compute_hmac(HmacAlgorithm::Sha1, self.auth_token.as_bytes(), data.as_bytes()),
            SignatureEncoding::Base64,
        )
    }

    /// An absolute request URL is authoritative; the configured webhook URL
    /// only expands relative paths. The absolute form is returned verbatim —
    /// Twilio signed those exact bytes.
    fn validation_url(&self, request: &WebhookRequest) -> Option<String> {
        if Url::parse(&request.url).is_ok() {
            return Some(request.url.clone());
        }
        let base = Url::parse(self.webhook_url.as_deref()?).ok()?;
        if request.url.is_empty() {
            return Some(base.to_string());
        }
        base.join(&request.url).ok().map(|joined| joined.to_string())
    }
}

impl WebhookVerifier for TwilioVerifier {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn verify(&self, request: &WebhookRequest) -> Verification {
        let Some(presented) = request.header(SIGNATURE_HEADER) else {
            return Verification::fail(
                PROVIDER,
                error_codes::MISSING_SIGNATURE,
                format!("missing `{SIGNATURE_HEADER}` header"),
            );
        };

        let Some(url) = self.validation_url(request) else {
            return Verification::fail(
                PROVIDER,
                error_codes::URL_MISMATCH,
                "no absolute request URL and no configured webhook URL",
            );
        };

        let expected = self.expected_signature(&url, &request.params);
        if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            return Verification::fail(
                PROVIDER,
                error_codes::INVALID_SIGNATURE,
                "signature does not match url + sorted parameters",
            );
        }

        // form posts become a JSON object; JSON bodies pass through
        let event = request.json_body().or_else(|| {
            let map: serde_json::Map<String, Value> = request
                .params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            Some(Value::Object(map))
        });

        Verification::ok(PROVIDER, event).with_metadata(json!({"validated_url": url}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "twilio_auth_token_12345";
    const URL: &str = "https://example.com/webhooks/twilio";

    fn signed_request(verifier: &TwilioVerifier, url: &str) -> WebhookRequest {
        let request = WebhookRequest::new(url, "")
            .with_param("CallSid", "CA123")
            .with_param("From", "+14155550100")
            .with_param("Body", "hello");
        let signature = verifier.expected_signature(url, &request.params);
        request.with_header(SIGNATURE_HEADER, signature)
    }

    #[test]
    fn valid_signature_over_sorted_params_passes() {
        let verifier = TwilioVerifier::new(TOKEN, None);
        let request = signed_request(&verifier, URL);
        let verification = verifier.verify(&request);
        assert!(verification.valid);
        assert_eq!(verification.event.unwrap()["CallSid"], json!("CA123"));
    }

    #[test]
    fn tampered_param_fails() {
        let verifier = TwilioVerifier::new(TOKEN, None);
        let mut request = signed_request(&verifier, URL);
        request.params.insert("Body".to_string(), "tampered".to_string());
        let verification = verifier.verify(&request);
        assert!(!verification.valid);
        assert_eq!(
            verification.error_code.as_deref(),
            Some(error_codes::INVALID_SIGNATURE)
        );
    }

    #[test]
    fn absolute_request_url_is_authoritative_over_base() {
        let verifier =
            TwilioVerifier::new(TOKEN, Some("https://other.example.com/hooks".to_string()));
        // signed against the absolute request URL, not the configured base
        let request = signed_request(&verifier, URL);
        assert!(verifier.verify(&request).valid);
    }

    #[test]
    fn relative_path_expands_against_configured_base() {
        let verifier = TwilioVerifier::new(TOKEN, Some("https://example.com".to_string()));
        let full_url = "https://example.com/webhooks/twilio";
        let request = WebhookRequest::new("/webhooks/twilio", "").with_param("CallSid", "CA9");
        let signature = verifier.expected_signature(full_url, &request.params);
        let request = request.with_header(SIGNATURE_HEADER, signature);
        assert!(verifier.verify(&request).valid);
    }

    #[test]
    fn missing_header_fails_cleanly() {
        let verifier = TwilioVerifier::new(TOKEN, None);
        let request = WebhookRequest::new(URL, "");
        assert_eq!(
            verifier.verify(&request).error_code.as_deref(),
            Some(error_codes::MISSING_SIGNATURE)
        );
    }
}
