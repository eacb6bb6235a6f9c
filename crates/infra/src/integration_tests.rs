//! Integration tests for the full ingest → queue → worker → store pipeline.
//!
//! Verifies:
//! - Fast path (completion within the wait budget) and slow path (202 then poll)
//! - Domain pre-check runs before anything is recorded
//! - Transient downstream failures are redelivered until they succeed
//! - Concurrent ingests of one request id converge on one side effect
//! - Exhausted retries end FAILED and dead-lettered

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use handoff_core::{DomainError, OwnerId, RequestId};

    use crate::config::{IngestConfig, QueueConfig, RetryPolicy, TtlPolicy, WorkerConfig};
    use crate::downstream::{DownstreamError, ScriptedGrantApi};
    use crate::grants::{GrantExecutor, GrantOperation, GrantStore, InMemoryGrantStore};
    use crate::ingest::{IngestError, IngestOutcome, IngestRequest, IngestService};
    use crate::queue::{InMemoryWorkQueue, WorkQueue};
    use crate::request_store::{ErrorCode, InMemoryRequestStore, RequestStatus, RequestStore};
    use crate::worker::{Outcome, WorkerHandler, WorkerRuntime};

    struct System {
        store: Arc<InMemoryRequestStore>,
        queue: Arc<InMemoryWorkQueue>,
        grants: Arc<InMemoryGrantStore>,
        api: Arc<ScriptedGrantApi>,
        ingest: IngestService,
        worker: WorkerRuntime,
    }

    fn system(max_receive_count: u32) -> System {
        let store = InMemoryRequestStore::arc();
        let queue = InMemoryWorkQueue::arc(QueueConfig {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count,
        });
        let grants = InMemoryGrantStore::arc();
        let api = ScriptedGrantApi::arc();

        let ingest = IngestService::new(
            store.clone(),
            queue.clone(),
            grants.clone(),
            IngestConfig {
                poll_interval: Duration::from_millis(10),
                ..IngestConfig::default()
            },
            TtlPolicy::default(),
        );
        let handler = WorkerHandler::new(
            store.clone(),
            GrantExecutor::new(api.clone(), grants.clone()),
            WorkerConfig {
                idle_interval: Duration::from_millis(5),
                max_receive_count,
                retry_policy: RetryPolicy::fixed(Duration::from_millis(10)),
                ..WorkerConfig::default()
            },
            TtlPolicy::default(),
        );
        let worker = WorkerRuntime::new(queue.clone(), handler);

        System {
            store,
            queue,
            grants,
            api,
            ingest,
            worker,
        }
    }

    fn owner() -> OwnerId {
        OwnerId::from_hashed("owner-under-test")
    }

    fn submit(id: Option<RequestId>, wait_ms: u64, operation: GrantOperation) -> IngestRequest {
        IngestRequest {
            owner_id: owner(),
            request_id: id,
            initial: false,
            wait: Some(Duration::from_millis(wait_ms)),
            operation,
        }
    }

    fn grant() -> GrantOperation {
        GrantOperation::grant("AB12CDE", Some("visitor parking")).unwrap()
    }

    #[tokio::test]
    async fn deferred_grant_completes_on_later_poll() {
        let sys = system(5);

        let first = sys.ingest.submit(submit(None, 0, grant())).await.unwrap();
        let IngestOutcome::Accepted { request_id } = first else {
            panic!("zero budget must defer");
        };

        let handle = sys.worker.clone().spawn("worker");
        let polled = sys
            .ingest
            .submit(submit(Some(request_id.clone()), 30_000, grant()))
            .await
            .unwrap();
        handle.shutdown().await;

        let IngestOutcome::Completed { result, .. } = polled else {
            panic!("expected completion within budget, got {polled:?}");
        };
        assert_eq!(result.status_code, 201);
        assert_eq!(result.body["status"], "granted");
        assert_eq!(result.body["granted"], true);

        // Replays are verbatim.
        let replay = sys
            .ingest
            .submit(submit(Some(request_id), 0, grant()))
            .await
            .unwrap();
        assert!(matches!(replay, IngestOutcome::Completed { result: ref r, .. } if *r == result));
        assert_eq!(sys.api.grants_issued(), 1);
        assert_eq!(sys.grants.list(&owner()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revoke_of_unknown_grant_is_not_found_before_enqueue() {
        let sys = system(5);
        let revoke = GrantOperation::revoke("AB12CDE").unwrap();

        let err = sys.ingest.submit(submit(None, 2_000, revoke)).await.unwrap_err();

        let IngestError::Domain(DomainError::NotFound(_)) = &err else {
            panic!("expected not found, got {err:?}");
        };
        assert!(err.to_string().contains("not found"));
        assert!(sys.store.is_empty());
        assert!(sys.queue.is_empty());
        assert_eq!(sys.api.revoke_calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered_until_success() {
        let sys = system(5);
        sys.api
            .push_failure(DownstreamError::from_status(503, None, "maintenance"));

        let accepted = sys.ingest.submit(submit(None, 0, grant())).await.unwrap();
        let request_id = accepted.request_id().clone();

        let report = sys.worker.run_once().await.unwrap();
        assert_eq!(report.count(Outcome::Deferred), 1);
        let record = sys.store.get(&request_id, &owner()).await.unwrap().unwrap();
        assert!(!record.is_terminal());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = sys.worker.run_once().await.unwrap();
        assert_eq!(report.count(Outcome::Completed), 1);

        let record = sys.store.get(&request_id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert!(sys.queue.is_empty());
    }

    #[tokio::test]
    async fn concurrent_ingests_share_one_side_effect() {
        let sys = system(5);
        let request_id = RequestId::generate();
        let handle = sys.worker.clone().spawn("worker");

        let (a, b) = tokio::join!(
            sys.ingest
                .submit(submit(Some(request_id.clone()), 5_000, grant())),
            sys.ingest
                .submit(submit(Some(request_id.clone()), 5_000, grant())),
        );
        handle.shutdown().await;

        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(matches!(a, IngestOutcome::Completed { .. }));
        assert_eq!(a, b);
        assert_eq!(sys.api.grant_calls(), 1);
        assert_eq!(sys.api.grants_issued(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_dead_letter() {
        let sys = system(2);
        sys.api
            .fail_next(10, DownstreamError::transient("connection reset", None));
        let lookup = GrantOperation::lookup("AB12CDE").unwrap();

        let accepted = sys.ingest.submit(submit(None, 0, lookup.clone())).await.unwrap();
        let request_id = accepted.request_id().clone();

        assert_eq!(sys.worker.run_once().await.unwrap().count(Outcome::Deferred), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sys.worker.run_once().await.unwrap().count(Outcome::Failed), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sys.worker.run_once().await.unwrap().messages.is_empty());

        let dead = sys.queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.request_id, request_id);

        let polled = sys
            .ingest
            .submit(submit(Some(request_id), 0, lookup))
            .await
            .unwrap();
        let IngestOutcome::Failed { error, .. } = polled else {
            panic!("expected a terminal failure");
        };
        assert_eq!(error.code, ErrorCode::DownstreamUnavailable);
        assert_eq!(error.http_status(), 502);
    }

    #[tokio::test]
    async fn grant_then_revoke_round_trip() {
        let sys = system(5);
        let handle = sys.worker.clone().spawn("worker");

        let granted = sys.ingest.submit(submit(None, 5_000, grant())).await.unwrap();
        assert!(matches!(granted, IngestOutcome::Completed { ref result, .. } if result.status_code == 201));

        let revoke = GrantOperation::revoke("AB12CDE").unwrap();
        let revoked = sys.ingest.submit(submit(None, 5_000, revoke.clone())).await.unwrap();
        handle.shutdown().await;

        let IngestOutcome::Completed { result, .. } = revoked else {
            panic!("expected revoke to complete");
        };
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body["status"], "revoked");

        // The grant is gone, so a fresh revoke is a 404 again.
        assert!(matches!(
            sys.ingest.submit(submit(None, 0, revoke)).await,
            Err(IngestError::Domain(DomainError::NotFound(_)))
        ));
    }
}
