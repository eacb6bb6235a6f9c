use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bearer-token claims model (transport-agnostic).
///
/// This is the minimal set of claims handoff expects once a token's signature
/// has been verified. Timestamps are seconds since the Unix epoch, as in JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (the caller's identity at the issuer).
    pub sub: String,

    /// Issued-at timestamp.
    pub iat: i64,

    /// Expiration timestamp.
    pub exp: i64,
}

impl AccessClaims {
    pub fn new(sub: impl Into<String>, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub: sub.into(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("missing bearer token")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (iat is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,

    #[error("token subject is empty")]
    EmptySubject,
}

/// Deterministically validate claims against `now`.
///
/// Note: this validates the *claims* only. Signature verification happens in
/// [`crate::verifier`].
pub fn validate_claims(claims: &AccessClaims, now: DateTime<Utc>) -> Result<(), TokenError> {
    if claims.sub.trim().is_empty() {
        return Err(TokenError::EmptySubject);
    }
    if claims.exp <= claims.iat {
        return Err(TokenError::InvalidTimeWindow);
    }
    let now = now.timestamp();
    if now < claims.iat {
        return Err(TokenError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenError::Expired);
    }
    Ok(())
}
