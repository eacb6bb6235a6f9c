//! Strongly-typed identifiers used across the workspace.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Longest idempotency key a client may supply.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Idempotency key for one logical operation.
///
/// Either supplied by the client (`x-request-id`) so retries converge, or
/// generated server-side as a UUIDv4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh server-side key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate a client-supplied key.
    ///
    /// Accepts 1..=128 characters drawn from `[A-Za-z0-9_-]`, which covers UUIDs
    /// and the usual ULID/nanoid shapes while keeping keys safe to echo in headers.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DomainError::invalid_id("request id must not be empty"));
        }
        if raw.len() > MAX_REQUEST_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "request id must be at most {MAX_REQUEST_ID_LEN} characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DomainError::invalid_id(
                "request id may only contain letters, digits, '-' and '_'",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Opaque owner identity: a hash of the authenticated subject.
///
/// The raw subject never leaves the auth boundary; everything downstream is
/// scoped by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wrap an already-hashed owner value (e.g. loaded from storage).
    pub fn from_hashed(hashed: impl Into<String>) -> Self {
        Self(hashed.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one queue message (distinct from the request it carries).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Uses UUIDv7 (time-ordered) so messages sort by enqueue time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MessageId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("MessageId: {e}")))?;
        Ok(Self(uuid))
    }
}
