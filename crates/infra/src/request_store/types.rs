//! Request record types and the status state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use handoff_core::{OwnerId, RequestId};

/// Lifecycle status of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Accepted and queued, not yet picked up.
    Pending,
    /// A worker has picked it up (possibly more than once under redelivery).
    Processing,
    /// Finished successfully; `result` is set.
    Completed,
    /// Finished with a recorded failure; `error` is set.
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Monotonic transition guard.
    ///
    /// `Processing -> Processing` is allowed so a redelivered message can
    /// re-enter processing after a worker crash.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Pending, Processing | Completed | Failed) => true,
            (Processing, Processing | Completed | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RequestStatus::Pending),
            "PROCESSING" => Some(RequestStatus::Processing),
            "COMPLETED" => Some(RequestStatus::Completed),
            "FAILED" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, caller-facing failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    DownstreamRejected,
    DownstreamUnavailable,
    InvalidPayload,
    InternalError,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::DownstreamRejected => 422,
            ErrorCode::InvalidPayload => 422,
            ErrorCode::DownstreamUnavailable => 502,
            ErrorCode::InternalError => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::DownstreamRejected => "downstream_rejected",
            ErrorCode::DownstreamUnavailable => "downstream_unavailable",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

/// Structured failure stored on a FAILED record.
///
/// Serialises to the wire error shape `{error, message, userMessage?, actionAdvice?}`
/// so a replay returns the exact same body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestError {
    #[serde(rename = "error")]
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_advice: Option<String>,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            user_message: None,
            action_advice: None,
        }
    }

    pub fn with_user_message(mut self, msg: impl Into<String>) -> Self {
        self.user_message = Some(msg.into());
        self
    }

    pub fn with_action_advice(mut self, advice: impl Into<String>) -> Self {
        self.action_advice = Some(advice.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

/// Successful outcome stored on a COMPLETED record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResult {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl RequestResult {
    pub fn new(status_code: u16, body: serde_json::Value) -> Self {
        Self { status_code, body }
    }
}

/// One logical operation's tracking row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub owner_id: OwnerId,
    pub status: RequestStatus,
    /// Opaque domain input; the worker decodes it into its typed shape.
    pub payload: serde_json::Value,
    pub result: Option<RequestResult>,
    pub error: Option<RequestError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Apply a transition in place. Callers check the guard first.
    pub(crate) fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) {
        self.status = transition.status;
        match &transition.outcome {
            TransitionData::None => {}
            TransitionData::Result(r) => self.result = Some(r.clone()),
            TransitionData::Error(e) => self.error = Some(e.clone()),
        }
        self.updated_at = now;
        if let Some(ttl) = transition.ttl {
            self.expires_at = expiry_from(now, ttl);
        }
    }
}

/// Input for [`super::RequestStore::create`].
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub request_id: RequestId,
    pub owner_id: OwnerId,
    pub payload: serde_json::Value,
    pub ttl: Duration,
}

impl NewRequest {
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> RequestRecord {
        RequestRecord {
            request_id: self.request_id,
            owner_id: self.owner_id,
            status: RequestStatus::Pending,
            payload: self.payload,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: expiry_from(now, self.ttl),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransitionData {
    None,
    Result(RequestResult),
    Error(RequestError),
}

/// A requested status change, with its data and an optional TTL refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub(crate) status: RequestStatus,
    pub(crate) outcome: TransitionData,
    pub(crate) ttl: Option<Duration>,
}

impl Transition {
    pub fn processing() -> Self {
        Self {
            status: RequestStatus::Processing,
            outcome: TransitionData::None,
            ttl: None,
        }
    }

    pub fn completed(result: RequestResult) -> Self {
        Self {
            status: RequestStatus::Completed,
            outcome: TransitionData::Result(result),
            ttl: None,
        }
    }

    pub fn failed(error: RequestError) -> Self {
        Self {
            status: RequestStatus::Failed,
            outcome: TransitionData::Error(error),
            ttl: None,
        }
    }

    /// Refresh the record's expiry to `now + ttl` when the transition applies.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn result(&self) -> Option<&RequestResult> {
        match &self.outcome {
            TransitionData::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RequestError> {
        match &self.outcome {
            TransitionData::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of [`super::RequestStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// This call created the record; the caller owns the enqueue.
    Created(RequestRecord),
    /// A live record already existed; nothing was written.
    Existing(RequestRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &RequestRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Result of [`super::RequestStore::transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(RequestRecord),
    /// The guard refused the change; the record is untouched.
    Ignored { current: RequestStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
