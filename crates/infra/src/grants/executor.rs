//! Idempotent execution of grant operations.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use handoff_core::{DomainError, OwnerId, RequestId};

use crate::downstream::{GrantApi, GrantRequest, RevokeRequest};
use crate::request_store::RequestResult;

use super::error::{ExecutionError, PrecheckError};
use super::operation::GrantOperation;
use super::store::{GrantReceipt, GrantStore};

/// Side-effect-free pre-check run by the ingest path before anything is queued.
///
/// Revoking a registration the owner holds no grant for is a deterministic 404.
/// A store that cannot answer is reported as such, never as "not found".
pub fn precheck(
    store: &dyn GrantStore,
    owner_id: &OwnerId,
    operation: &GrantOperation,
) -> Result<(), PrecheckError> {
    if let GrantOperation::Revoke {
        registration_number,
    } = operation
    {
        if store.find(owner_id, registration_number)?.is_none() {
            return Err(DomainError::not_found(format!("grant for {registration_number}")).into());
        }
    }
    Ok(())
}

/// Performs grant operations against the downstream API and the grant store.
///
/// Every operation is safe to repeat for the same request id: grants are keyed
/// downstream by an idempotency key derived from the request, the receipt is
/// stored first-writer-wins, and revokes of absent grants succeed.
#[derive(Clone)]
pub struct GrantExecutor {
    api: Arc<dyn GrantApi>,
    store: Arc<dyn GrantStore>,
}

impl core::fmt::Debug for GrantExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GrantExecutor").finish_non_exhaustive()
    }
}

impl GrantExecutor {
    pub fn new(api: Arc<dyn GrantApi>, store: Arc<dyn GrantStore>) -> Self {
        Self { api, store }
    }

    pub fn store(&self) -> &Arc<dyn GrantStore> {
        &self.store
    }

    pub async fn execute(
        &self,
        owner_id: &OwnerId,
        request_id: &RequestId,
        operation: &GrantOperation,
    ) -> Result<RequestResult, ExecutionError> {
        match operation {
            GrantOperation::Grant {
                registration_number,
                purpose,
            } => {
                if let Some(existing) = self.store.find(owner_id, registration_number)? {
                    debug!(request_id = %request_id, "grant already on record");
                    return Ok(granted_result(&existing, request_id));
                }

                let confirmation = self
                    .api
                    .grant(&GrantRequest {
                        idempotency_key: idempotency_key(owner_id, request_id),
                        registration_number: registration_number.clone(),
                        purpose: purpose.clone(),
                    })
                    .await?;

                let stored = self.store.insert_if_absent(GrantReceipt {
                    owner_id: owner_id.clone(),
                    registration_number: registration_number.clone(),
                    receipt_id: confirmation.receipt_id,
                    request_id: request_id.clone(),
                    purpose: purpose.clone(),
                    granted_at: confirmation.granted_at,
                })?;
                info!(
                    request_id = %request_id,
                    receipt_id = %stored.receipt_id,
                    "grant issued"
                );
                Ok(granted_result(&stored, request_id))
            }
            GrantOperation::Revoke {
                registration_number,
            } => {
                self.api
                    .revoke(&RevokeRequest {
                        idempotency_key: idempotency_key(owner_id, request_id),
                        registration_number: registration_number.clone(),
                    })
                    .await?;
                self.store.remove(owner_id, registration_number)?;
                info!(request_id = %request_id, "grant revoked");

                Ok(RequestResult::new(
                    200,
                    json!({
                        "status": "revoked",
                        "granted": false,
                        "registrationNumber": registration_number,
                    }),
                ))
            }
            GrantOperation::Lookup {
                registration_number,
            } => {
                let status = self.api.status(registration_number).await?;
                let mut body = json!({
                    "status": if status.granted { "granted" } else { "not_granted" },
                    "granted": status.granted,
                    "registrationNumber": registration_number,
                });
                if let Some(receipt) = self.store.find(owner_id, registration_number)? {
                    body["receiptId"] = json!(receipt.receipt_id);
                    body["grantedAt"] = json!(receipt.granted_at);
                }
                Ok(RequestResult::new(200, body))
            }
        }
    }
}

/// Request ids are only unique per owner, so the downstream key includes both.
fn idempotency_key(owner_id: &OwnerId, request_id: &RequestId) -> String {
    format!("{owner_id}:{request_id}")
}

/// 201 for the request that issued the grant, 200 for any other request that
/// finds it already on record.
fn granted_result(receipt: &GrantReceipt, request_id: &RequestId) -> RequestResult {
    let mut body = json!({
        "status": "granted",
        "granted": true,
        "registrationNumber": receipt.registration_number,
        "receiptId": receipt.receipt_id,
        "grantedAt": receipt.granted_at,
    });

    if &receipt.request_id == request_id {
        RequestResult::new(201, body)
    } else {
        body["alreadyGranted"] = json!(true);
        RequestResult::new(200, body)
    }
}
