use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use handoff_core::DomainError;
use handoff_infra::grants::user_facing;
use handoff_infra::ingest::IngestError;
use handoff_infra::request_store::{ErrorCode, RequestError};

/// Rejected before anything was recorded: validation (400) or pre-check (404).
pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let code = match &err {
        DomainError::NotFound(_) => ErrorCode::NotFound,
        DomainError::Validation(_) | DomainError::MissingField(_) | DomainError::InvalidId(_) => {
            ErrorCode::ValidationError
        }
    };
    request_error_response(&user_facing(code, err.to_string()))
}

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::Domain(err) => domain_error_to_response(err),
        IngestError::Store(err) => {
            error!(error = %err, "request store failure during ingest");
            request_error_response(&user_facing(ErrorCode::InternalError, err.to_string()))
        }
        IngestError::Grants(err) => {
            error!(error = %err, "grant store failure during pre-check");
            request_error_response(&user_facing(ErrorCode::InternalError, err.to_string()))
        }
        IngestError::Queue(err) => {
            error!(error = %err, "work queue failure during ingest");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", err.to_string())
        }
    }
}

/// Stored or synthesised failure, rendered with its mapped status.
pub fn request_error_response(error: &RequestError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(error)).into_response()
}

pub fn unauthorized() -> axum::response::Response {
    json_error(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "missing or invalid bearer token",
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
