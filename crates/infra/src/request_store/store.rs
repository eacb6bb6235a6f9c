//! Request store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use handoff_core::{OwnerId, RequestId};

use super::types::{
    CreateOutcome, NewRequest, RequestRecord, RequestStatus, Transition, TransitionOutcome,
};

/// Durable key-value store with one record per `(request_id, owner_id)`.
///
/// Every write is conditional: `create` never overwrites a live record and
/// `transition` never leaves a terminal state. These guards are the only
/// per-request mutual exclusion in the system.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a PENDING record unless a live one already exists.
    async fn create(&self, request: NewRequest) -> Result<CreateOutcome, RequestStoreError>;

    /// Fetch the current record. Expired records read as `None`.
    async fn get(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<Option<RequestRecord>, RequestStoreError>;

    /// Conditionally move a record to a new status.
    ///
    /// Refused transitions (terminal record, backwards move) return
    /// [`TransitionOutcome::Ignored`] and leave the record untouched.
    async fn transition(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        transition: Transition,
    ) -> Result<TransitionOutcome, RequestStoreError>;

    /// Claim the right to re-enqueue a stale PENDING record.
    ///
    /// Succeeds only while the record is live, still PENDING and last touched
    /// at or before `stale_before`. A successful claim refreshes `updated_at`,
    /// so exactly one caller wins per window.
    async fn claim_requeue(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RequestStoreError>;

    /// Remove a record outright (used to roll back a create whose enqueue failed).
    async fn delete(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<(), RequestStoreError>;

    /// Reclaim expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, RequestStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestStoreError {
    #[error("request not found: {0}")]
    NotFound(RequestId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S> RequestStore for Arc<S>
where
    S: RequestStore + ?Sized,
{
    async fn create(&self, request: NewRequest) -> Result<CreateOutcome, RequestStoreError> {
        (**self).create(request).await
    }

    async fn get(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<Option<RequestRecord>, RequestStoreError> {
        (**self).get(request_id, owner_id).await
    }

    async fn transition(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        transition: Transition,
    ) -> Result<TransitionOutcome, RequestStoreError> {
        (**self).transition(request_id, owner_id, transition).await
    }

    async fn claim_requeue(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RequestStoreError> {
        (**self).claim_requeue(request_id, owner_id, stale_before).await
    }

    async fn delete(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<(), RequestStoreError> {
        (**self).delete(request_id, owner_id).await
    }

    async fn purge_expired(&self) -> Result<usize, RequestStoreError> {
        (**self).purge_expired().await
    }
}

/// Log a refused transition. Attempts against a terminal record are anomalies
/// (duplicate delivery that raced past the worker's own terminal check).
pub(crate) fn log_refused_transition(
    request_id: &RequestId,
    current: RequestStatus,
    attempted: RequestStatus,
) {
    if current.is_terminal() {
        warn!(
            request_id = %request_id,
            current = %current,
            attempted = %attempted,
            "refused to overwrite terminal request state"
        );
    } else {
        debug!(
            request_id = %request_id,
            current = %current,
            attempted = %attempted,
            "refused non-monotonic transition"
        );
    }
}

type Key = (RequestId, OwnerId);

/// In-memory request store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    records: RwLock<HashMap<Key, RequestRecord>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored rows, expired ones included (test helper).
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> RequestStoreError {
    RequestStoreError::Storage("request store lock poisoned".to_string())
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, request: NewRequest) -> Result<CreateOutcome, RequestStoreError> {
        let now = Utc::now();
        let mut records = self.records.write().map_err(poisoned)?;
        let key = (request.request_id.clone(), request.owner_id.clone());

        if let Some(existing) = records.get(&key) {
            if !existing.is_expired(now) {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }

        let record = request.into_record(now);
        records.insert(key, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn get(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<Option<RequestRecord>, RequestStoreError> {
        let now = Utc::now();
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .get(&(request_id.clone(), owner_id.clone()))
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn transition(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        transition: Transition,
    ) -> Result<TransitionOutcome, RequestStoreError> {
        if transition.status() == RequestStatus::Pending {
            return Err(RequestStoreError::InvalidTransition(
                "records cannot be moved back to PENDING".to_string(),
            ));
        }

        let now = Utc::now();
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records
            .get_mut(&(request_id.clone(), owner_id.clone()))
            .filter(|r| !r.is_expired(now))
            .ok_or_else(|| RequestStoreError::NotFound(request_id.clone()))?;

        if !record.status.can_transition_to(transition.status()) {
            log_refused_transition(request_id, record.status, transition.status());
            return Ok(TransitionOutcome::Ignored {
                current: record.status,
            });
        }

        record.apply(&transition, now);
        Ok(TransitionOutcome::Applied(record.clone()))
    }

    async fn claim_requeue(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RequestStoreError> {
        let now = Utc::now();
        let mut records = self.records.write().map_err(poisoned)?;
        match records
            .get_mut(&(request_id.clone(), owner_id.clone()))
            .filter(|r| !r.is_expired(now))
        {
            Some(r) if r.status == RequestStatus::Pending && r.updated_at <= stale_before => {
                r.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<(), RequestStoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.remove(&(request_id.clone(), owner_id.clone()));
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, RequestStoreError> {
        let now = Utc::now();
        let mut records = self.records.write().map_err(poisoned)?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::request_store::types::{ErrorCode, RequestError, RequestResult};

    fn owner() -> OwnerId {
        OwnerId::from_hashed("owner-a")
    }

    fn new_request(id: &RequestId, ttl: Duration) -> NewRequest {
        NewRequest {
            request_id: id.clone(),
            owner_id: owner(),
            payload: json!({"op": "grant"}),
            ttl,
        }
    }

    #[tokio::test]
    async fn create_is_a_no_op_for_existing_records() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();

        let first = store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();
        assert!(first.was_created());

        store
            .transition(&id, &owner(), Transition::processing())
            .await
            .unwrap();

        let second = store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();
        assert!(!second.was_created());
        assert_eq!(second.record().status, RequestStatus::Processing);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn records_are_scoped_by_owner() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();

        let other = OwnerId::from_hashed("owner-b");
        assert!(store.get(&id, &other).await.unwrap().is_none());
        assert!(matches!(
            store.transition(&id, &other, Transition::processing()).await,
            Err(RequestStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();

        let done = store
            .transition(
                &id,
                &owner(),
                Transition::completed(RequestResult::new(201, json!({"granted": true}))),
            )
            .await
            .unwrap();
        assert!(done.is_applied());

        let again = store
            .transition(
                &id,
                &owner(),
                Transition::failed(RequestError::new(ErrorCode::InternalError, "late")),
            )
            .await
            .unwrap();
        assert_eq!(
            again,
            TransitionOutcome::Ignored {
                current: RequestStatus::Completed
            }
        );

        let reprocess = store
            .transition(&id, &owner(), Transition::processing())
            .await
            .unwrap();
        assert!(!reprocess.is_applied());

        let record = store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.result.unwrap().body, json!({"granted": true}));
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn expired_records_are_unreadable_and_purged() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        store.create(new_request(&id, Duration::ZERO)).await.unwrap();

        assert!(store.get(&id, &owner()).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expired_record_can_be_recreated() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        store.create(new_request(&id, Duration::ZERO)).await.unwrap();

        let again = store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();
        assert!(again.was_created());
    }

    #[tokio::test]
    async fn transition_refreshes_ttl() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        let created = store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();

        let year = Duration::from_secs(365 * 24 * 3600);
        let applied = store
            .transition(
                &id,
                &owner(),
                Transition::completed(RequestResult::new(200, json!({}))).with_ttl(year),
            )
            .await
            .unwrap();

        let TransitionOutcome::Applied(record) = applied else {
            panic!("transition should apply");
        };
        assert!(record.expires_at > created.record().expires_at);
    }

    #[tokio::test]
    async fn moving_back_to_pending_is_rejected() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();

        let pending = Transition {
            status: RequestStatus::Pending,
            ..Transition::processing()
        };
        assert!(matches!(
            store.transition(&id, &owner(), pending).await,
            Err(RequestStoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn requeue_claim_is_won_once_per_window() {
        let store = InMemoryRequestStore::new();
        let id = RequestId::generate();
        store.create(new_request(&id, Duration::from_secs(60))).await.unwrap();

        let cutoff = Utc::now();
        assert!(store.claim_requeue(&id, &owner(), cutoff).await.unwrap());
        assert!(!store.claim_requeue(&id, &owner(), cutoff).await.unwrap());

        store
            .transition(&id, &owner(), Transition::processing())
            .await
            .unwrap();
        assert!(!store.claim_requeue(&id, &owner(), Utc::now()).await.unwrap());
        assert!(
            !store
                .claim_requeue(&RequestId::generate(), &owner(), Utc::now())
                .await
                .unwrap()
        );
    }
}
