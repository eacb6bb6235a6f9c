use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use handoff_core::RegistrationNumber;

use super::error::DownstreamError;

/// Grant call. `idempotency_key` is the request id, so a redelivered message
/// cannot issue a second grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub idempotency_key: String,
    pub registration_number: RegistrationNumber,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeRequest {
    pub idempotency_key: String,
    pub registration_number: RegistrationNumber,
}

/// Receipt returned by the downstream for an issued grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantConfirmation {
    pub receipt_id: String,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantStatus {
    pub granted: bool,
}

/// The wrapped, quota-constrained third-party API.
#[async_trait]
pub trait GrantApi: Send + Sync {
    async fn grant(&self, request: &GrantRequest) -> Result<GrantConfirmation, DownstreamError>;

    /// Revoke a grant. Revoking something already gone succeeds.
    async fn revoke(&self, request: &RevokeRequest) -> Result<(), DownstreamError>;

    async fn status(
        &self,
        registration_number: &RegistrationNumber,
    ) -> Result<GrantStatus, DownstreamError>;
}

#[async_trait]
impl<A> GrantApi for Arc<A>
where
    A: GrantApi + ?Sized,
{
    async fn grant(&self, request: &GrantRequest) -> Result<GrantConfirmation, DownstreamError> {
        (**self).grant(request).await
    }

    async fn revoke(&self, request: &RevokeRequest) -> Result<(), DownstreamError> {
        (**self).revoke(request).await
    }

    async fn status(
        &self,
        registration_number: &RegistrationNumber,
    ) -> Result<GrantStatus, DownstreamError> {
        (**self).status(registration_number).await
    }
}
