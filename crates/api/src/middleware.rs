use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use handoff_auth::{TokenError, TokenVerifier};

use crate::app::{errors, headers};
use crate::context::{OwnerContext, RequestIdContext};

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Verify the bearer token and attach the caller's [`OwnerContext`].
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let principal = match extract_bearer(req.headers())
        .and_then(|token| state.verifier.verify(token, Utc::now()))
    {
        Ok(principal) => principal,
        Err(err) => {
            debug!(error = %err, "rejected bearer credential");
            return errors::unauthorized();
        }
    };

    req.extensions_mut()
        .insert(OwnerContext::new(principal.owner_id().clone()));

    next.run(req).await
}

/// Resolve `x-request-id` (or mint one) and echo it on the response.
///
/// Malformed ids are not echoed; the handler rejects them after auth.
pub async fn request_id_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let context = match headers::request_id(req.headers()) {
        Ok(Some(id)) => RequestIdContext::supplied(id),
        Ok(None) => RequestIdContext::generated(),
        Err(err) => RequestIdContext::invalid(err),
    };
    let echo = context
        .request_id()
        .and_then(|id| HeaderValue::from_str(id.as_str()).ok());

    req.extensions_mut().insert(context);
    let mut res = next.run(req).await;

    if let Some(value) = echo {
        res.headers_mut().insert(headers::REQUEST_ID, value);
    }
    res
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, TokenError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(TokenError::Missing)?;

    let header = header
        .to_str()
        .map_err(|_| TokenError::Malformed("authorization header is not ASCII".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| TokenError::Malformed("expected a Bearer credential".into()))?
        .trim();
    if token.is_empty() {
        return Err(TokenError::Missing);
    }

    Ok(token)
}
