//! Backend wiring: request store, work queue, downstream API, and the services
//! built over them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info};

use handoff_infra::downstream::{GrantApi, HttpGrantApi, ScriptedGrantApi};
use handoff_infra::grants::{GrantExecutor, GrantStore, InMemoryGrantStore};
use handoff_infra::ingest::IngestService;
use handoff_infra::queue::{InMemoryWorkQueue, WorkQueue};
use handoff_infra::request_store::{InMemoryRequestStore, PostgresRequestStore, RequestStore};
use handoff_infra::request_store::postgres::DEFAULT_TABLE;
use handoff_infra::worker::{WorkerHandler, WorkerRuntime};

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppServices {
    ingest: IngestService,
    worker: WorkerRuntime,
    requests: Arc<dyn RequestStore>,
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices")
            .field("ingest", &self.ingest)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl AppServices {
    /// Fully in-memory wiring (dev/test) over the given downstream API.
    pub fn in_memory(config: &AppConfig, api: Arc<dyn GrantApi>) -> Self {
        Self::assemble(
            config,
            InMemoryRequestStore::arc(),
            InMemoryWorkQueue::arc(config.queue.clone()),
            api,
        )
    }

    /// Wire whichever backends the configuration names.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let requests: Arc<dyn RequestStore> = match &config.database_url {
            Some(url) => {
                let pool = PgPool::connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                let store = PostgresRequestStore::new(pool, DEFAULT_TABLE)?;
                store.ensure_schema().await?;
                info!("using Postgres request store");
                Arc::new(store)
            }
            None => {
                info!("DATABASE_URL not set; using in-memory request store");
                InMemoryRequestStore::arc()
            }
        };

        let queue = build_queue(config).await?;

        let api: Arc<dyn GrantApi> = match &config.downstream {
            Some(downstream) => {
                info!(base_url = %downstream.base_url, "using HTTP grant API");
                Arc::new(HttpGrantApi::new(
                    downstream.base_url.clone(),
                    downstream.api_key.clone(),
                    downstream.timeout,
                )?)
            }
            None => {
                info!("DOWNSTREAM_BASE_URL not set; using scripted in-memory grant API");
                ScriptedGrantApi::arc()
            }
        };

        Ok(Self::assemble(config, requests, queue, api))
    }

    fn assemble(
        config: &AppConfig,
        requests: Arc<dyn RequestStore>,
        queue: Arc<dyn WorkQueue>,
        api: Arc<dyn GrantApi>,
    ) -> Self {
        // Grant receipts are the permanent domain record; kept in-process here.
        let grants: Arc<dyn GrantStore> = InMemoryGrantStore::arc();

        let ingest = IngestService::new(
            requests.clone(),
            queue.clone(),
            grants.clone(),
            config.ingest.clone(),
            config.ttl,
        );
        let handler = WorkerHandler::new(
            requests.clone(),
            GrantExecutor::new(api, grants),
            config.worker.clone(),
            config.ttl,
        );
        let worker = WorkerRuntime::new(queue, handler);

        Self {
            ingest,
            worker,
            requests,
        }
    }

    pub fn ingest(&self) -> &IngestService {
        &self.ingest
    }

    pub fn worker(&self) -> &WorkerRuntime {
        &self.worker
    }

    /// Periodically delete expired request records.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let requests = self.requests.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match requests.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "purged expired request records"),
                    Err(e) => error!(error = %e, "failed to purge expired request records"),
                }
            }
        })
    }
}

#[cfg(feature = "redis")]
async fn build_queue(config: &AppConfig) -> anyhow::Result<Arc<dyn WorkQueue>> {
    use handoff_infra::queue::RedisStreamsWorkQueue;

    match &config.redis_url {
        Some(url) => {
            let consumer = format!("handoff-{}", std::process::id());
            let queue = RedisStreamsWorkQueue::connect(url, consumer, config.queue.clone())
                .await
                .context("failed to connect to Redis")?;
            info!("using Redis Streams work queue");
            Ok(Arc::new(queue))
        }
        None => {
            info!("REDIS_URL not set; using in-memory work queue");
            Ok(InMemoryWorkQueue::arc(config.queue.clone()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn build_queue(config: &AppConfig) -> anyhow::Result<Arc<dyn WorkQueue>> {
    if config.redis_url.is_some() {
        anyhow::bail!("REDIS_URL is set but the redis feature is not enabled");
    }
    info!("using in-memory work queue");
    Ok(InMemoryWorkQueue::arc(config.queue.clone()))
}
