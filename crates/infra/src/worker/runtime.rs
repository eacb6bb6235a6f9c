//! Background receive → handle → ack/retry loop.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueError, WorkQueue};

use super::handler::{BatchReport, Disposition, Outcome, WorkerHandler};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub messages_processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped: u64,
    pub queue_errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.messages_processed += report.messages.len() as u64;
        self.completed += report.count(Outcome::Completed) as u64;
        self.failed += report.count(Outcome::Failed) as u64;
        self.skipped += report.count(Outcome::Skipped) as u64;
        self.retried += report.retries() as u64;
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerRuntimeHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerRuntimeHandle {
    /// Request graceful shutdown and wait for the in-flight batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Drives a [`WorkerHandler`] from a [`WorkQueue`].
#[derive(Clone)]
pub struct WorkerRuntime {
    queue: Arc<dyn WorkQueue>,
    handler: WorkerHandler,
}

impl core::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(queue: Arc<dyn WorkQueue>, handler: WorkerHandler) -> Self {
        Self { queue, handler }
    }

    /// Receive one batch, handle it, and settle every message with the queue.
    pub async fn run_once(&self) -> Result<BatchReport, QueueError> {
        let deliveries = self
            .queue
            .receive(self.handler.config().batch_size)
            .await?;
        if deliveries.is_empty() {
            return Ok(BatchReport::default());
        }

        let report = self.handler.handle_batch(&deliveries).await;
        for message in &report.messages {
            let settled = match message.disposition {
                Disposition::Done => self.queue.ack(&message.receipt).await,
                Disposition::Retry { delay } => {
                    self.queue.retry_later(&message.receipt, delay).await
                }
            };
            // A stale receipt means the message was redelivered meanwhile; the
            // next holder settles it.
            if let Err(e) = settled {
                warn!(receipt = %message.receipt, error = %e, "failed to settle message");
            }
        }
        Ok(report)
    }

    /// Spawn the loop as a tokio task.
    pub fn spawn(self, name: impl Into<String>) -> WorkerRuntimeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(self, name.into(), shutdown_rx, stats.clone()));

        WorkerRuntimeHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn worker_loop(
    runtime: WorkerRuntime,
    name: String,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %name, "worker started");
    let started = Instant::now();
    let idle = runtime.handler.config().idle_interval;

    while !*shutdown.borrow() {
        let result = runtime.run_once().await;

        let wait = {
            let Ok(mut s) = stats.lock() else {
                error!(worker = %name, "worker stats lock poisoned");
                break;
            };
            s.uptime_secs = started.elapsed().as_secs();
            match &result {
                Ok(report) if report.messages.is_empty() => Some(idle),
                Ok(report) => {
                    s.record(report);
                    debug!(
                        worker = %name,
                        messages = report.messages.len(),
                        retried = report.retries(),
                        "batch handled"
                    );
                    None
                }
                Err(e) => {
                    s.queue_errors += 1;
                    error!(worker = %name, error = %e, "failed to receive from queue");
                    Some(idle)
                }
            }
        };

        if let Some(wait) = wait {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    info!(worker = %name, "worker stopped");
}
