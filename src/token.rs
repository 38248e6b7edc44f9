//! Signed bearer tokens: three dot-joined base64url segments (header,
//! claims, HMAC-SHA256 signature over `header.claims`). The subject is the
//! lowercased account email; expiry is optional and driven by the session
//! TTL in days (0 = no expiry).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub subject: Option<String>,
}

impl Verification {
    fn invalid() -> Self { Self { valid: false, subject: None } }
}

#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn issue(&self, subject: &str, ttl_days: i64) -> String {
        self.issue_at(subject, ttl_days, Utc::now())
    }

    pub fn issue_at(&self, subject: &str, ttl_days: i64, issued_at: DateTime<Utc>) -> String {
        let iat = issued_at.timestamp();
        let claims = Claims {
            sub: subject.trim().to_lowercase(),
            iat,
            exp: (ttl_days > 0).then(|| iat + ttl_days * SECONDS_PER_DAY),
        };
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"TP"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
        let msg = format!("{header}.{body}");
        let sig = URL_SAFE_NO_PAD.encode(self.sign(msg.as_bytes()));
        format!("{msg}.{sig}")
    }

    pub fn verify(&self, token: &str) -> Verification {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Verification {
        let mut parts = token.split('.');
        let (Some(header), Some(body), Some(sig), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Verification::invalid();
        };

        let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(sig) else { return Verification::invalid() };
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(m) => m,
            Err(_) => return Verification::invalid(),
        };
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        // Constant-time comparison via the MAC itself.
        if mac.verify_slice(&sig_bytes).is_err() {
            return Verification::invalid();
        }

        let Ok(raw) = URL_SAFE_NO_PAD.decode(body) else { return Verification::invalid() };
        let Ok(claims) = serde_json::from_slice::<Claims>(&raw) else { return Verification::invalid() };
        let subject = claims.sub.trim().to_lowercase();
        if subject.is_empty() {
            return Verification::invalid();
        }
        if let Some(exp) = claims.exp {
            if now.timestamp() >= exp {
                return Verification::invalid();
            }
        }
        Verification { valid: true, subject: Some(subject) }
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
