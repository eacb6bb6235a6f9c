use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use handoff_core::{DomainError, OwnerId, RequestId};

use crate::config::{IngestConfig, TtlPolicy};
use crate::grants::{GrantOperation, GrantStore, GrantStoreError, PrecheckError, precheck};
use crate::queue::{QueueError, QueueMessage, WorkQueue};
use crate::request_store::{
    CreateOutcome, ErrorCode, NewRequest, RequestError, RequestRecord, RequestResult,
    RequestStatus, RequestStore, RequestStoreError,
};

/// One authenticated, validated call to the front door.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub owner_id: OwnerId,
    /// Client-supplied idempotency key; generated when absent.
    pub request_id: Option<RequestId>,
    /// Caller asserts the request id is new, so the initial lookup is skipped.
    pub initial: bool,
    /// Requested wait budget; `None` uses the configured default.
    pub wait: Option<Duration>,
    pub operation: GrantOperation,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Finished within the budget (or replayed); the stored result.
    Completed {
        request_id: RequestId,
        result: RequestResult,
    },
    /// Finished within the budget (or replayed) with a recorded failure.
    Failed {
        request_id: RequestId,
        error: RequestError,
    },
    /// Budget exhausted; poll again with the same request id.
    Accepted { request_id: RequestId },
}

impl IngestOutcome {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Completed { request_id, .. }
            | Self::Failed { request_id, .. }
            | Self::Accepted { request_id } => request_id,
        }
    }

    /// `None` while the record is still in flight.
    fn from_record(record: RequestRecord) -> Option<Self> {
        let request_id = record.request_id;
        match record.status {
            RequestStatus::Pending | RequestStatus::Processing => None,
            RequestStatus::Completed => Some(match record.result {
                Some(result) => Self::Completed { request_id, result },
                None => Self::Failed {
                    request_id,
                    error: RequestError::new(
                        ErrorCode::InternalError,
                        "completed request has no stored result",
                    ),
                },
            }),
            RequestStatus::Failed => Some(Self::Failed {
                request_id,
                error: record.error.unwrap_or_else(|| {
                    RequestError::new(ErrorCode::InternalError, "failed request has no stored error")
                }),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Rejected before anything was recorded (validation or domain pre-check).
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("request store error: {0}")]
    Store(#[from] RequestStoreError),
    /// The pre-check could not read the owner's grants.
    #[error("grant store error: {0}")]
    Grants(#[from] GrantStoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<PrecheckError> for IngestError {
    fn from(err: PrecheckError) -> Self {
        match err {
            PrecheckError::Rejected(err) => Self::Domain(err),
            PrecheckError::Store(err) => Self::Grants(err),
        }
    }
}

/// The front door: records, enqueues, and waits up to the budget.
#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn RequestStore>,
    queue: Arc<dyn WorkQueue>,
    grants: Arc<dyn GrantStore>,
    config: IngestConfig,
    ttl: TtlPolicy,
}

impl core::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IngestService")
            .field("config", &self.config)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl IngestService {
    pub fn new(
        store: Arc<dyn RequestStore>,
        queue: Arc<dyn WorkQueue>,
        grants: Arc<dyn GrantStore>,
        config: IngestConfig,
        ttl: TtlPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            grants,
            config,
            ttl,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    #[instrument(
        skip(self, request),
        fields(owner_id = %request.owner_id, op = request.operation.name())
    )]
    pub async fn submit(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        let IngestRequest {
            owner_id,
            request_id,
            initial,
            wait,
            operation,
        } = request;
        let request_id = request_id.unwrap_or_else(RequestId::generate);
        let budget = self.config.wait_budget(wait);

        let existing = if initial {
            None
        } else {
            self.store.get(&request_id, &owner_id).await?
        };

        match existing {
            Some(record) => {
                if let Some(outcome) = IngestOutcome::from_record(record.clone()) {
                    debug!(request_id = %request_id, "replaying stored outcome");
                    return Ok(outcome);
                }
                if record.payload != operation.to_payload() {
                    warn!(request_id = %request_id, "request id reused with a different payload");
                }
                self.recover_orphan(&record).await?;
            }
            None => {
                precheck(self.grants.as_ref(), &owner_id, &operation)?;

                let created = self
                    .store
                    .create(NewRequest {
                        request_id: request_id.clone(),
                        owner_id: owner_id.clone(),
                        payload: operation.to_payload(),
                        ttl: self.ttl.standard,
                    })
                    .await?;

                match created {
                    CreateOutcome::Created(record) => self.enqueue_new(&record).await?,
                    CreateOutcome::Existing(record) => {
                        // Lost a create race, or the initial hint was wrong.
                        if let Some(outcome) = IngestOutcome::from_record(record) {
                            return Ok(outcome);
                        }
                    }
                }
            }
        }

        self.wait_for_outcome(request_id, &owner_id, budget).await
    }

    async fn enqueue_new(&self, record: &RequestRecord) -> Result<(), IngestError> {
        let message = QueueMessage::new(
            record.owner_id.clone(),
            record.request_id.clone(),
            record.payload.clone(),
        );

        match self.queue.send(message).await {
            Ok(message_id) => {
                info!(request_id = %record.request_id, message_id = %message_id, "request accepted");
                Ok(())
            }
            Err(err) => {
                // Without a message nothing would ever finish this record.
                if let Err(delete_err) = self
                    .store
                    .delete(&record.request_id, &record.owner_id)
                    .await
                {
                    error!(
                        request_id = %record.request_id,
                        error = %delete_err,
                        "failed to roll back request after enqueue failure"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Re-enqueue a PENDING record that has sat untouched for too long, e.g.
    /// because the process died between create and enqueue.
    ///
    /// The store claims the requeue first, so concurrent or repeated polls
    /// send at most one message per `requeue_after` window.
    async fn recover_orphan(&self, record: &RequestRecord) -> Result<(), IngestError> {
        if record.status != RequestStatus::Pending {
            return Ok(());
        }
        let now = Utc::now();
        let Some(stale_before) = chrono::Duration::from_std(self.config.requeue_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(());
        };
        if record.updated_at > stale_before {
            return Ok(());
        }
        if !self
            .store
            .claim_requeue(&record.request_id, &record.owner_id, stale_before)
            .await?
        {
            debug!(request_id = %record.request_id, "stale pending request already re-enqueued");
            return Ok(());
        }

        let age = (now - record.updated_at).to_std().unwrap_or(Duration::ZERO);
        warn!(
            request_id = %record.request_id,
            age_secs = age.as_secs(),
            "re-enqueueing stale pending request"
        );
        self.queue
            .send(QueueMessage::new(
                record.owner_id.clone(),
                record.request_id.clone(),
                record.payload.clone(),
            ))
            .await?;
        Ok(())
    }

    async fn wait_for_outcome(
        &self,
        request_id: RequestId,
        owner_id: &OwnerId,
        budget: Duration,
    ) -> Result<IngestOutcome, IngestError> {
        // An unrepresentable deadline degrades to a single read.
        let deadline = Instant::now().checked_add(budget).unwrap_or_else(Instant::now);

        loop {
            match self.store.get(&request_id, owner_id).await? {
                Some(record) => {
                    if let Some(outcome) = IngestOutcome::from_record(record) {
                        return Ok(outcome);
                    }
                }
                None => {
                    // Expired or rolled back underneath us; a later poll re-creates it.
                    debug!(request_id = %request_id, "request record vanished while waiting");
                    return Ok(IngestOutcome::Accepted { request_id });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(IngestOutcome::Accepted { request_id });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use handoff_core::MessageId;

    use super::*;
    use crate::grants::{GrantReceipt, InMemoryGrantStore};
    use crate::queue::{DeadLetterEntry, Delivery, InMemoryWorkQueue, QueueConfig, Receipt};
    use crate::request_store::{InMemoryRequestStore, Transition};

    struct Harness {
        store: Arc<InMemoryRequestStore>,
        queue: Arc<InMemoryWorkQueue>,
        grants: Arc<InMemoryGrantStore>,
        service: IngestService,
    }

    fn harness(config: IngestConfig) -> Harness {
        let store = InMemoryRequestStore::arc();
        let queue = InMemoryWorkQueue::arc(QueueConfig::default());
        let grants = InMemoryGrantStore::arc();
        let service = IngestService::new(
            store.clone(),
            queue.clone(),
            grants.clone(),
            config,
            TtlPolicy::default(),
        );
        Harness {
            store,
            queue,
            grants,
            service,
        }
    }

    fn owner() -> OwnerId {
        OwnerId::from_hashed("owner")
    }

    fn request(id: Option<RequestId>, wait_ms: u64, operation: GrantOperation) -> IngestRequest {
        IngestRequest {
            owner_id: owner(),
            request_id: id,
            initial: false,
            wait: Some(Duration::from_millis(wait_ms)),
            operation,
        }
    }

    #[tokio::test]
    async fn new_request_with_zero_budget_is_accepted_and_enqueued_once() {
        let h = harness(IngestConfig::default());
        let op = GrantOperation::grant("AB12CDE", None).unwrap();

        let outcome = h.service.submit(request(None, 0, op.clone())).await.unwrap();
        let IngestOutcome::Accepted { request_id } = outcome else {
            panic!("expected 202");
        };
        assert_eq!(h.queue.len(), 1);

        // A poll with the same id neither re-creates nor re-enqueues.
        let again = h
            .service
            .submit(request(Some(request_id.clone()), 0, op))
            .await
            .unwrap();
        assert_eq!(again, IngestOutcome::Accepted { request_id });
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn terminal_records_are_replayed_verbatim() {
        let h = harness(IngestConfig::default());
        let op = GrantOperation::grant("AB12CDE", None).unwrap();
        let id = RequestId::generate();
        h.service.submit(request(Some(id.clone()), 0, op.clone())).await.unwrap();

        let result = RequestResult::new(201, serde_json::json!({"status": "granted"}));
        h.store
            .transition(&id, &owner(), Transition::completed(result.clone()))
            .await
            .unwrap();

        for _ in 0..2 {
            let outcome = h.service.submit(request(Some(id.clone()), 0, op.clone())).await.unwrap();
            assert_eq!(
                outcome,
                IngestOutcome::Completed {
                    request_id: id.clone(),
                    result: result.clone()
                }
            );
        }
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn revoke_without_grant_is_not_found_and_records_nothing() {
        let h = harness(IngestConfig::default());
        let op = GrantOperation::revoke("AB12CDE").unwrap();

        let err = h.service.submit(request(None, 0, op)).await.unwrap_err();
        assert!(matches!(err, IngestError::Domain(DomainError::NotFound(_))));
        assert!(err.to_string().contains("not found"));
        assert!(h.store.is_empty());
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn revoke_with_grant_is_accepted() {
        let h = harness(IngestConfig::default());
        h.grants
            .insert_if_absent(GrantReceipt {
                owner_id: owner(),
                registration_number: handoff_core::RegistrationNumber::parse("AB12CDE").unwrap(),
                receipt_id: "r1".into(),
                request_id: RequestId::generate(),
                purpose: None,
                granted_at: Utc::now(),
            })
            .unwrap();

        let op = GrantOperation::revoke("AB12CDE").unwrap();
        let outcome = h.service.submit(request(None, 0, op)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn wrong_initial_hint_does_not_enqueue_twice() {
        let h = harness(IngestConfig::default());
        let op = GrantOperation::lookup("AB12CDE").unwrap();
        let id = RequestId::generate();

        let mut req = request(Some(id.clone()), 0, op);
        req.initial = true;
        h.service.submit(req.clone()).await.unwrap();
        h.service.submit(req).await.unwrap();

        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn completion_within_budget_is_returned_synchronously() {
        let h = harness(IngestConfig {
            poll_interval: Duration::from_millis(10),
            ..IngestConfig::default()
        });
        let op = GrantOperation::lookup("AB12CDE").unwrap();
        let id = RequestId::generate();

        let store = h.store.clone();
        let finisher_id = id.clone();
        let finisher = tokio::spawn(async move {
            // Wait for the ingest path to create the record, then complete it.
            loop {
                if store.get(&finisher_id, &owner()).await.unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            store
                .transition(
                    &finisher_id,
                    &owner(),
                    Transition::completed(RequestResult::new(200, serde_json::json!({"granted": false}))),
                )
                .await
                .unwrap();
        });

        let outcome = h.service.submit(request(Some(id), 5_000, op)).await.unwrap();
        finisher.await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Completed { ref result, .. } if result.status_code == 200));
    }

    #[tokio::test]
    async fn unreadable_grant_store_is_a_store_failure_not_a_missing_grant() {
        let h = harness(IngestConfig::default());
        h.grants
            .insert_if_absent(GrantReceipt {
                owner_id: owner(),
                registration_number: handoff_core::RegistrationNumber::parse("AB12CDE").unwrap(),
                receipt_id: "r1".into(),
                request_id: RequestId::generate(),
                purpose: None,
                granted_at: Utc::now(),
            })
            .unwrap();
        h.grants.poison();

        let op = GrantOperation::revoke("AB12CDE").unwrap();
        let err = h.service.submit(request(None, 0, op)).await.unwrap_err();
        assert!(matches!(err, IngestError::Grants(GrantStoreError::Storage(_))));
        assert!(h.store.is_empty());
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn stale_pending_record_is_re_enqueued_once_per_window() {
        let h = harness(IngestConfig {
            requeue_after: Duration::from_millis(10),
            ..IngestConfig::default()
        });
        let op = GrantOperation::lookup("AB12CDE").unwrap();
        let id = RequestId::generate();

        h.service.submit(request(Some(id.clone()), 0, op.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..5 {
            h.service.submit(request(Some(id.clone()), 0, op.clone())).await.unwrap();
        }
        assert_eq!(h.queue.len(), 2);

        // A fresh window allows one more.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..3 {
            h.service.submit(request(Some(id.clone()), 0, op.clone())).await.unwrap();
        }
        assert_eq!(h.queue.len(), 3);
    }

    #[tokio::test]
    async fn huge_wait_budget_does_not_overflow_the_deadline() {
        let h = harness(IngestConfig {
            max_wait: Duration::MAX,
            ..IngestConfig::default()
        });
        let op = GrantOperation::lookup("AB12CDE").unwrap();

        let outcome = h
            .service
            .submit(IngestRequest {
                wait: Some(Duration::MAX),
                ..request(None, 0, op)
            })
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    struct FailingQueue;

    #[async_trait]
    impl WorkQueue for FailingQueue {
        async fn send(&self, _message: QueueMessage) -> Result<MessageId, QueueError> {
            Err(QueueError::Broker("down".into()))
        }
        async fn receive(&self, _max: usize) -> Result<Vec<Delivery>, QueueError> {
            Ok(vec![])
        }
        async fn ack(&self, _receipt: &Receipt) -> Result<(), QueueError> {
            Ok(())
        }
        async fn retry_later(&self, _receipt: &Receipt, _delay: Duration) -> Result<(), QueueError> {
            Ok(())
        }
        async fn dead_letters(&self, _limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
            Ok(vec![])
        }
        async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError> {
            Err(QueueError::NotFound(*message_id))
        }
    }

    #[tokio::test]
    async fn enqueue_failure_rolls_back_the_record() {
        let store = InMemoryRequestStore::arc();
        let service = IngestService::new(
            store.clone(),
            Arc::new(FailingQueue),
            InMemoryGrantStore::arc(),
            IngestConfig::default(),
            TtlPolicy::default(),
        );

        let op = GrantOperation::grant("AB12CDE", None).unwrap();
        let err = service.submit(request(None, 0, op)).await.unwrap_err();
        assert!(matches!(err, IngestError::Queue(_)));
        assert!(store.is_empty());
    }
}
