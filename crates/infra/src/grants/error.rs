//! Execution failures and their caller-facing wording.

use std::time::Duration;

use handoff_core::DomainError;

use crate::downstream::{DownstreamError, DownstreamErrorKind};
use crate::request_store::{ErrorCode, RequestError};

use super::store::GrantStoreError;

/// Why the ingest pre-check refused a request.
#[derive(Debug, thiserror::Error)]
pub enum PrecheckError {
    /// Deterministic rejection, e.g. revoking a grant the owner does not hold.
    #[error(transparent)]
    Rejected(#[from] DomainError),
    /// The grant store could not answer.
    #[error(transparent)]
    Store(#[from] GrantStoreError),
}

/// Outcome of a failed side effect, classified for the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Worth redelivering; the record stays non-terminal.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Final; recorded as FAILED with this error.
    #[error("terminal failure: {}", .0.message)]
    Terminal(RequestError),
    /// Unexpected fault on our side; retried up to the max receive count.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The error to record when no further attempts will be made.
    pub fn into_request_error(self) -> RequestError {
        match self {
            Self::Terminal(err) => err,
            Self::Transient { message, .. } => {
                user_facing(ErrorCode::DownstreamUnavailable, message)
            }
            Self::Internal(message) => user_facing(ErrorCode::InternalError, message),
        }
    }
}

impl From<GrantStoreError> for ExecutionError {
    fn from(err: GrantStoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<DownstreamError> for ExecutionError {
    fn from(err: DownstreamError) -> Self {
        match err.kind {
            DownstreamErrorKind::Transient { retry_after } => Self::Transient {
                message: err.message,
                retry_after,
            },
            DownstreamErrorKind::Terminal => Self::Terminal(user_facing(err.code, err.message)),
        }
    }
}

/// Attach the user message and advice for `code`.
pub fn user_facing(code: ErrorCode, message: impl Into<String>) -> RequestError {
    let (user_message, advice) = match code {
        ErrorCode::ValidationError => (
            "Some of the details provided are not valid.",
            "Correct the highlighted fields and try again.",
        ),
        ErrorCode::NotFound => (
            "We could not find that vehicle.",
            "Check the registration number and try again.",
        ),
        ErrorCode::DownstreamRejected => (
            "Access could not be granted for this vehicle.",
            "Check the registration number. If it is correct, contact support.",
        ),
        ErrorCode::DownstreamUnavailable => (
            "The access service is unavailable right now.",
            "Please try again in a few minutes.",
        ),
        ErrorCode::InvalidPayload => (
            "This request could not be processed.",
            "Submit the request again with a new request id.",
        ),
        ErrorCode::InternalError => (
            "Something went wrong on our side.",
            "Please try again later. Contact support if the problem persists.",
        ),
    };

    RequestError::new(code, message)
        .with_user_message(user_message)
        .with_action_advice(advice)
}
