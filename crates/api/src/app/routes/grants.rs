use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Query,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use handoff_core::{DomainError, DomainResult};
use handoff_infra::grants::GrantOperation;
use handoff_infra::ingest::{IngestOutcome, IngestRequest};

use crate::app::services::AppServices;
use crate::app::{errors, headers};
use crate::context::{OwnerContext, RequestIdContext};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantBody {
    pub registration_number: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantQuery {
    pub registration_number: Option<String>,
}

fn registration_number(value: Option<&str>) -> DomainResult<&str> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(DomainError::MissingField("registrationNumber"))
}

pub async fn create_grant(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Extension(request_id): Extension<RequestIdContext>,
    headers: HeaderMap,
    body: Result<Json<GrantBody>, JsonRejection>,
) -> axum::response::Response {
    let operation = body
        .map_err(|e| DomainError::validation(e.body_text()))
        .and_then(|Json(body)| {
            GrantOperation::grant(
                registration_number(body.registration_number.as_deref())?,
                body.purpose.as_deref(),
            )
        });
    submit(&services, owner, request_id, &headers, operation).await
}

pub async fn lookup_grant(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Extension(request_id): Extension<RequestIdContext>,
    headers: HeaderMap,
    query: Result<Query<GrantQuery>, QueryRejection>,
) -> axum::response::Response {
    let operation = query
        .map_err(|e| DomainError::validation(e.body_text()))
        .and_then(|Query(q)| {
            GrantOperation::lookup(registration_number(q.registration_number.as_deref())?)
        });
    submit(&services, owner, request_id, &headers, operation).await
}

pub async fn revoke_grant(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Extension(request_id): Extension<RequestIdContext>,
    headers: HeaderMap,
    query: Result<Query<GrantQuery>, QueryRejection>,
) -> axum::response::Response {
    let operation = query
        .map_err(|e| DomainError::validation(e.body_text()))
        .and_then(|Query(q)| {
            GrantOperation::revoke(registration_number(q.registration_number.as_deref())?)
        });
    submit(&services, owner, request_id, &headers, operation).await
}

/// Shared ingest path: validate control headers, hand off, and render the outcome.
async fn submit(
    services: &AppServices,
    owner: OwnerContext,
    request_id: RequestIdContext,
    headers: &HeaderMap,
    operation: DomainResult<GrantOperation>,
) -> axum::response::Response {
    let prepared = request_id.resolve().and_then(|id| {
        Ok((
            id.clone(),
            operation?,
            headers::wait_time(headers)?,
            headers::initial_request(headers)?,
        ))
    });
    let (id, operation, wait, initial) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => return errors::domain_error_to_response(err),
    };

    let request = IngestRequest {
        owner_id: owner.owner_id().clone(),
        request_id: Some(id),
        // A server-minted id cannot have a prior record.
        initial: initial || request_id.is_generated(),
        wait,
        operation,
    };

    match services.ingest().submit(request).await {
        Ok(outcome) => outcome_to_response(outcome),
        Err(err) => errors::ingest_error_to_response(err),
    }
}

fn outcome_to_response(outcome: IngestOutcome) -> axum::response::Response {
    match outcome {
        IngestOutcome::Completed { result, .. } => {
            let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
            (status, Json(result.body)).into_response()
        }
        IngestOutcome::Failed { error, .. } => errors::request_error_response(&error),
        IngestOutcome::Accepted { request_id } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "requestId": request_id.as_str(),
            })),
        )
            .into_response(),
    }
}
