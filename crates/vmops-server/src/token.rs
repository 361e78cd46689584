//! Compact HS256 bearer tokens.
//!
//! `base64url(header).base64url(claims).base64url(hmac_sha256(header "." claims))`.
//! Verification never fails loudly: every problem maps to a [`TokenRejection`].

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

pub const ACCESS_TOKEN_TYPE: &str = "access";
pub const PROVISIONING_TOKEN_TYPE: &str = "provisioning";
pub const LEASE_TOKEN_TYPE: &str = "lease";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Claims {
    pub typ: String,
    pub sub: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// `iat`/`exp` are filled in by [`sign`].
    pub fn new(typ: &str, sub: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            typ: typ.to_string(),
            sub: sub.into(),
            tenant_id: tenant_id.into(),
            user_id: None,
            roles: Vec::new(),
            jti: None,
            iat: 0,
            exp: 0,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenRejection {
    Malformed,
    BadSignature,
    UnsupportedAlgorithm,
    WrongType,
    Expired,
}

impl TokenRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::BadSignature => "bad_signature",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::WrongType => "wrong_type",
            Self::Expired => "expired",
        }
    }
}

/// Stamps `iat = now`, `exp = now + ttl` and signs the claims.
pub fn sign(mut claims: Claims, secret: &[u8], ttl: Duration) -> String {
    let now = Utc::now().timestamp();
    claims.iat = now;
    claims.exp = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
    encode(&claims, secret)
}

fn encode(claims: &Claims, secret: &[u8]) -> String {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: "JWT".to_string(),
    };
    // Serializing plain structs of strings and integers cannot fail.
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(mac(secret, signing_input.as_bytes()).finalize().into_bytes());
    format!("{signing_input}.{signature}")
}

pub fn verify(token: &str, secret: &[u8], expected_type: &str) -> Result<Claims, TokenRejection> {
    let mut segments = token.trim().split('.');
    let (Some(header), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenRejection::Malformed);
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| TokenRejection::Malformed)?;
    let header_json: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| TokenRejection::Malformed)?;
    if header_json.alg != ALGORITHM {
        return Err(TokenRejection::UnsupportedAlgorithm);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenRejection::Malformed)?;
    let signing_input = format!("{header}.{payload}");
    mac(secret, signing_input.as_bytes())
        .verify_slice(&signature)
        .map_err(|_| TokenRejection::BadSignature)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenRejection::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenRejection::Malformed)?;
    if claims.typ != expected_type {
        return Err(TokenRejection::WrongType);
    }
    if claims.exp <= Utc::now().timestamp() {
        return Err(TokenRejection::Expired);
    }
    Ok(claims)
}

fn mac(secret: &[u8], input: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(input);
    mac
}
