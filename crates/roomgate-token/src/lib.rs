//! HMAC-signed scoped tokens for short-lived attendance views.
//!
//! Tokens are compact `payload.signature` strings: base64url(JSON claims)
//! followed by base64url(HMAC-SHA256 over the payload). They grant exactly
//! one scope against exactly one booking and expire on their own, so a
//! leaked link goes stale without any server-side session state.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Scope granted to attendance-view tokens.
pub const SCOPE_ATTENDANCE_VIEW: &str = "attendance_view";

/// Default token lifetime in minutes.
pub const TOKEN_TTL_MINS: i64 = 15;

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    SecretTooShort(usize),
    #[error("failed to encode token claims: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key material for token signing. Construction enforces a minimum length
/// so a misconfigured deployment fails at startup, not at verify time.
#[derive(Clone)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SECRET_LEN {
            return Err(TokenError::SecretTooShort(bytes.len()));
        }
        Ok(Self(bytes))
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC-SHA256 accepts keys of any length.
        HmacSha256::new_from_slice(&self.0).unwrap_or_else(|_| unreachable!())
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningSecret(..)")
    }
}

/// Claims carried inside a token. Timestamps are unix seconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub booking_id: Uuid,
    pub scope: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue an attendance-view token for `booking_id`, valid for
/// `ttl_minutes` from `now`. [`TOKEN_TTL_MINS`] is the stock lifetime.
pub fn issue_attendance_token(
    secret: &SigningSecret,
    booking_id: Uuid,
    now: DateTime<Utc>,
    ttl_minutes: i64,
) -> Result<String, TokenError> {
    let claims = TokenClaims {
        booking_id,
        scope: SCOPE_ATTENDANCE_VIEW.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(ttl_minutes)).timestamp(),
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);

    let mut mac = secret.mac();
    mac.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", payload, signature))
}

/// Verify a token string and return its claims.
///
/// Returns `None` for any failure: malformed structure, bad signature,
/// wrong scope, or expiry. Callers get no signal about which check failed.
pub fn verify_attendance_token(
    secret: &SigningSecret,
    token: &str,
    now: DateTime<Utc>,
) -> Option<TokenClaims> {
    let (payload, signature) = token.split_once('.')?;
    if payload.is_empty() || signature.contains('.') {
        return None;
    }

    let sig_bytes = URL_SAFE_NO_PAD.decode(signature).ok()?;
    let mut mac = secret.mac();
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig_bytes).ok()?;

    let claims: TokenClaims =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;

    if claims.scope != SCOPE_ATTENDANCE_VIEW {
        return None;
    }
    if now.timestamp() >= claims.exp {
        return None;
    }

    Some(claims)
}
