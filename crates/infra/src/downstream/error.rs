//! Downstream failure classification.

use std::time::Duration;

use crate::request_store::ErrorCode;

/// Whether a downstream failure is worth redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamErrorKind {
    /// Rate limited or temporarily unavailable; the request stays non-terminal.
    Transient { retry_after: Option<Duration> },
    /// Will not succeed on retry; recorded as FAILED.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("downstream {}: {}", .code.as_str(), .message)]
pub struct DownstreamError {
    pub kind: DownstreamErrorKind,
    /// HTTP status returned by the downstream, when there was a response.
    pub status: Option<u16>,
    /// Caller-facing code recorded if the failure ends up terminal.
    pub code: ErrorCode,
    pub message: String,
}

impl DownstreamError {
    pub fn transient(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: DownstreamErrorKind::Transient { retry_after },
            status: None,
            code: ErrorCode::DownstreamUnavailable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: DownstreamErrorKind::Terminal,
            status: None,
            code: ErrorCode::DownstreamRejected,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: DownstreamErrorKind::Terminal,
            status: None,
            code: ErrorCode::NotFound,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: DownstreamErrorKind::Terminal,
            status: None,
            code: ErrorCode::DownstreamUnavailable,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// | Status | Kind | Code |
    /// |--------|------|------|
    /// | 408, 429, 502, 503, 504 | transient | `downstream_unavailable` |
    /// | 400, 422, other 4xx | terminal | `downstream_rejected` |
    /// | 404 | terminal | `not_found` |
    /// | other 5xx | terminal | `downstream_unavailable` |
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        let mut err = match status {
            408 | 429 | 502 | 503 | 504 => Self::transient(message, retry_after),
            404 => Self::not_found(message),
            400..=499 => Self::rejected(message),
            _ => Self::unavailable(message),
        };
        err.status = Some(status);
        err
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, DownstreamErrorKind::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self.kind {
            DownstreamErrorKind::Transient { retry_after } => retry_after,
            DownstreamErrorKind::Terminal => None,
        }
    }
}

impl From<reqwest::Error> for DownstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Self::transient(err.to_string(), None);
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), None, err.to_string());
        }
        if err.is_decode() {
            return Self::unavailable(format!("unexpected response body: {err}"));
        }
        Self::transient(err.to_string(), None)
    }
}

/// Parse a `Retry-After` header given in seconds. HTTP-date values are ignored.
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_gateway_errors_are_transient() {
        for status in [408, 429, 502, 503, 504] {
            let err = DownstreamError::from_status(status, None, "busy");
            assert!(err.is_transient(), "{status} should be transient");
            assert_eq!(err.status, Some(status));
        }
    }

    #[test]
    fn client_errors_are_terminal_rejections() {
        for status in [400, 401, 403, 409, 422] {
            let err = DownstreamError::from_status(status, None, "nope");
            assert!(!err.is_transient());
            assert_eq!(err.code, ErrorCode::DownstreamRejected);
        }
        assert_eq!(
            DownstreamError::from_status(404, None, "gone").code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn other_server_errors_are_terminal_unavailable() {
        let err = DownstreamError::from_status(500, None, "boom");
        assert!(!err.is_transient());
        assert_eq!(err.code, ErrorCode::DownstreamUnavailable);
    }

    #[test]
    fn retry_after_is_kept_for_transient_errors_only() {
        let hint = Some(Duration::from_secs(7));
        assert_eq!(
            DownstreamError::from_status(429, hint, "slow down").retry_after(),
            hint
        );
        assert_eq!(DownstreamError::from_status(400, hint, "bad").retry_after(), None);
    }

    #[test]
    fn retry_after_header_parsing() {
        assert_eq!(parse_retry_after(Some(" 12 ")), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
