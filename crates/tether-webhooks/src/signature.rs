use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// HMAC over the payload. The key length is unrestricted for all supported
/// digests, so construction cannot fail.
pub fn compute_hmac(algorithm: HmacAlgorithm, secret: &[u8], payload: &[u8]) -> Vec<u8> {
    match algorithm {
        HmacAlgorithm::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        HmacAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        HmacAlgorithm::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

pub fn encode_signature(bytes: &[u8], encoding: SignatureEncoding) -> String {
    match encoding {
        SignatureEncoding::Hex => hex::encode(bytes),
        SignatureEncoding::Base64 => BASE64.encode(bytes),
    }
}

/// Constant-time equality; a length mismatch is an immediate (still
/// data-independent) failure.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Compute, encode, and compare against a presented signature string.
pub fn verify_hmac(
    algorithm: HmacAlgorithm,
    encoding: SignatureEncoding,
    secret: &[u8],
    payload: &[u8],
    presented: &str,
) -> bool {
    let expected = encode_signature(&compute_hmac(algorithm, secret, payload), encoding);
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

/// Validity window for signed timestamps: rejects stale payloads past
/// `max_age_seconds` and future timestamps beyond the tolerated clock skew.
#[derive(Debug, Clone, Copy)]
pub struct TimestampWindow {
    pub max_age_seconds: i64,
    pub future_skew_seconds: i64,
}

impl TimestampWindow {
    pub fn new(max_age_seconds: i64) -> Self {
        Self {
            max_age_seconds,
            future_skew_seconds: 60,
        }
    }

    pub fn validate(&self, timestamp: i64, now: i64) -> Result<(), String> {
        let age = now - timestamp;
        if age > self.max_age_seconds {
            return Err(format!(
                "timestamp is {age}s old, past the {}s window",
                self.max_age_seconds
            ));
        }
        if age < -self.future_skew_seconds {
            return Err(format!(
                "timestamp is {}s in the future, past the {}s skew allowance",
                -age, self.future_skew_seconds
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2202 / RFC 4231 test case 2: key "Jefe", data
    // "what do ya want for nothing?"
    const KEY: &[u8] = b"Jefe";
    const DATA: &[u8] = b"what do ya want for nothing?";

    #[test]
    fn hmac_sha1_matches_rfc_2202_vector() {
        let sig = compute_hmac(HmacAlgorithm::Sha1, KEY, DATA);
        assert_eq!(hex::encode(sig), "effcbf48b77f6f8506b757382033dd9701fe075f");
    }

    #[test]
    fn hmac_sha256_matches_rfc_4231_vector() {
        let sig = compute_hmac(HmacAlgorithm::Sha256, KEY, DATA);
        assert_eq!(
            hex::encode(sig),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hmac_sha512_matches_rfc_4231_vector() {
        let sig = compute_hmac(HmacAlgorithm::Sha512, KEY, DATA);
        assert_eq!(
            hex::encode(sig),
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea250554\
             9758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737"
        );
    }

    #[test]
    fn base64_encoding_round_trips() {
        let sig = compute_hmac(HmacAlgorithm::Sha1, KEY, DATA);
        let encoded = encode_signature(&sig, SignatureEncoding::Base64);
        assert!(verify_hmac(
            HmacAlgorithm::Sha1,
            SignatureEncoding::Base64,
            KEY,
            DATA,
            &encoded
        ));
        assert!(!verify_hmac(
            HmacAlgorithm::Sha1,
            SignatureEncoding::Base64,
            KEY,
            b"tampered",
            &encoded
        ));
    }

    #[test]
    fn timestamp_window_rejects_stale_and_future() {
        let window = TimestampWindow::new(300);
        assert!(window.validate(1_000, 1_100).is_ok());
        assert!(window.validate(1_000, 1_301).is_err());
        // within the 60s future skew
        assert!(window.validate(1_150, 1_100).is_ok());
        assert!(window.validate(1_161, 1_100).is_err());
    }

    #[test]
    fn constant_time_eq_requires_equal_length() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
