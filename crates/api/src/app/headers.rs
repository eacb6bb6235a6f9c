//! Control headers shared by every `/grants` call.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName};

use handoff_core::{DomainError, DomainResult, RequestId};

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const WAIT_TIME_MS: HeaderName = HeaderName::from_static("x-wait-time-ms");
pub const INITIAL_REQUEST: HeaderName = HeaderName::from_static("x-initial-request");

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> DomainResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map(str::trim)
                .map_err(|_| DomainError::validation(format!("{name} must be ASCII")))
        })
        .transpose()
}

/// Client-supplied idempotency key, if any.
pub fn request_id(headers: &HeaderMap) -> DomainResult<Option<RequestId>> {
    header_str(headers, &REQUEST_ID)?
        .map(RequestId::parse)
        .transpose()
}

/// Requested wait budget. The cap is applied by the ingest service.
pub fn wait_time(headers: &HeaderMap) -> DomainResult<Option<Duration>> {
    header_str(headers, &WAIT_TIME_MS)?
        .map(|raw| {
            raw.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                DomainError::validation(format!(
                    "{WAIT_TIME_MS} must be a non-negative integer, got {raw:?}"
                ))
            })
        })
        .transpose()
}

pub fn initial_request(headers: &HeaderMap) -> DomainResult<bool> {
    match header_str(headers, &INITIAL_REQUEST)? {
        None => Ok(false),
        Some(raw) if raw.eq_ignore_ascii_case("true") || raw == "1" => Ok(true),
        Some(raw) if raw.eq_ignore_ascii_case("false") || raw == "0" => Ok(false),
        Some(raw) => Err(DomainError::validation(format!(
            "{INITIAL_REQUEST} must be true, false, 1 or 0, got {raw:?}"
        ))),
    }
}
