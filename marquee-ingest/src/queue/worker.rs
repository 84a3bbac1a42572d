//! Queue worker
//!
//! Claims jobs from one logical queue and runs the matching service. Job
//! handlers are idempotent, so a redelivery after a crash or an expired lease
//! only repeats work the storage layer already absorbs.
//!
//! **Failure policy:**
//! - batch-level errors (storage, transient source errors, malformed payloads)
//!   go back to the queue for a retry with backoff;
//! - anything else is absorbed at once: the terminal effect below is applied
//!   and the job completes.
//!
//! **Terminal effects** (retry budget spent, or absorbed failure):
//! - `DiscoverPage`: the cursor becomes `stalled`;
//! - `ResolveManifestEntity`: the entry becomes `failed`;
//! - `MaterializeManifest`: the manifest becomes `failed`;
//! - `ResolveItem`: logged; nothing was created.

use futures::future::join_all;
use marquee_common::events::IngestEvent;
use marquee_common::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClaimedJob, FailOutcome, JobPayload};
use crate::db::cursors;
use crate::error::IngestResult;
use crate::services::manifest_state::materialize_when_resolved;
use crate::services::{
    DiscoveryOutcome, DiscoveryScheduler, ItemPipeline, ManifestResolver, RelationMaterializer,
    ResumeController,
};
use crate::IngestContext;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Worker {
    ctx: IngestContext,
    lease: Duration,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(ctx: IngestContext) -> Self {
        let lease = Duration::from_secs(ctx.config.import.lease_seconds.max(1));
        Self {
            ctx,
            lease,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Process `queue` with up to `concurrency` jobs in flight until cancelled
    ///
    /// On cancellation no new job is claimed; jobs already running finish.
    pub async fn run(
        &self,
        queue: &str,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> IngestResult<()> {
        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(queue, concurrency, "Worker started");

        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| Error::Internal(format!("worker semaphore closed: {}", e)))?
                }
                _ = cancel.cancelled() => break,
            };

            match self.ctx.queue.claim(queue, self.lease).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue, error = %e, "Claim failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval * 4) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        // Wait for in-flight jobs by taking every permit back
        let _drained = semaphore
            .acquire_many(concurrency as u32)
            .await
            .map_err(|e| Error::Internal(format!("worker semaphore closed: {}", e)))?;
        info!(queue, "Worker stopped");
        Ok(())
    }

    /// Drain `queues` until none has a due job; returns the jobs processed
    ///
    /// Jobs waiting out a backoff delay are left queued.
    pub async fn run_until_idle(&self, queues: &[&str], concurrency: usize) -> IngestResult<usize> {
        let concurrency = concurrency.max(1);
        let mut processed = 0;

        loop {
            let mut claimed_any = false;

            for queue in queues {
                loop {
                    let mut batch = Vec::with_capacity(concurrency);
                    while batch.len() < concurrency {
                        match self.ctx.queue.claim(queue, self.lease).await? {
                            Some(job) => batch.push(job),
                            None => break,
                        }
                    }
                    if batch.is_empty() {
                        break;
                    }

                    claimed_any = true;
                    processed += batch.len();
                    join_all(batch.into_iter().map(|job| self.process(job))).await;
                }
            }

            if !claimed_any {
                break;
            }
        }

        debug!(processed, "Queues idle");
        Ok(processed)
    }

    async fn process(&self, job: ClaimedJob) {
        let job_id = job.job_id;
        let queue = job.queue.clone();
        if let Err(e) = self.settle(job).await {
            error!(job_id = %job_id, queue = %queue, error = %e, "Could not record job outcome");
        }
    }

    async fn settle(&self, job: ClaimedJob) -> IngestResult<()> {
        let result = self.handle(&job.payload).await;

        match result {
            Ok(()) => {
                self.ctx.queue.complete(job.job_id).await?;
            }
            Err(e) if e.is_batch_level() => {
                let reason = e.to_string();
                match self.ctx.queue.fail(job.job_id, &reason).await? {
                    FailOutcome::Retrying { run_after } => {
                        warn!(
                            job_id = %job.job_id,
                            queue = %job.queue,
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            run_after = %run_after,
                            error = %reason,
                            "Job failed, will retry"
                        );
                    }
                    FailOutcome::Exhausted => {
                        error!(
                            job_id = %job.job_id,
                            queue = %job.queue,
                            attempts = job.attempts,
                            error = %reason,
                            "Job retry budget exhausted"
                        );
                        self.apply_terminal_effect(&job.payload, &reason).await?;
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(job_id = %job.job_id, queue = %job.queue, error = %reason, "Job failure absorbed");
                self.apply_terminal_effect(&job.payload, &reason).await?;
                self.ctx.queue.complete(job.job_id).await?;
            }
        }

        Ok(())
    }

    /// Run the service behind one payload
    pub async fn handle(&self, payload: &JobPayload) -> IngestResult<()> {
        match payload {
            JobPayload::DiscoverPage { stream } => {
                let scheduler = DiscoveryScheduler::new(self.ctx.clone());
                let outcome = scheduler.run_once(stream).await?;
                if let DiscoveryOutcome::Advanced { finished: false, .. } = outcome {
                    scheduler.schedule(stream).await?;
                }
            }
            JobPayload::ResolveItem { stream, item } => {
                ItemPipeline::new(self.ctx.clone())
                    .process_item(stream.as_deref(), item)
                    .await?;
            }
            JobPayload::ResolveManifestEntity {
                manifest_id,
                entry_key,
            } => {
                ManifestResolver::new(self.ctx.clone())
                    .resolve_entry(*manifest_id, entry_key)
                    .await?;
                materialize_when_resolved(&self.ctx, *manifest_id).await?;
            }
            JobPayload::MaterializeManifest { manifest_id } => {
                RelationMaterializer::new(self.ctx.clone())
                    .materialize(*manifest_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_terminal_effect(&self, payload: &JobPayload, reason: &str) -> IngestResult<()> {
        match payload {
            JobPayload::DiscoverPage { stream } => {
                if cursors::mark_stalled(&self.ctx.db, stream, reason).await? {
                    warn!(stream = %stream, reason, "Cursor stalled");
                    self.ctx.event_bus.emit_lossy(IngestEvent::CursorStalled {
                        stream: stream.clone(),
                        reason: reason.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            JobPayload::ResolveItem { item, .. } => {
                warn!(kind = %item.kind, title = %item.title, reason, "Catalog item dropped");
            }
            JobPayload::ResolveManifestEntity {
                manifest_id,
                entry_key,
            } => {
                ManifestResolver::new(self.ctx.clone())
                    .fail_entry(*manifest_id, entry_key, reason)
                    .await?;
                materialize_when_resolved(&self.ctx, *manifest_id).await?;
            }
            JobPayload::MaterializeManifest { manifest_id } => {
                ResumeController::new(self.ctx.clone())
                    .fail_manifest(*manifest_id, reason)
                    .await?;
            }
        }
        Ok(())
    }
}
