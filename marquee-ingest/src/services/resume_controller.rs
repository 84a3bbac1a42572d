//! Retry/Resume Controller
//!
//! Reads persisted manifest and cursor state and restarts exactly the
//! unfinished work:
//! - a manifest re-runs Phase B only for entries still `pending` or `failed`,
//!   then Phase C only for relations not yet `created`;
//! - a cursor resumes at `last_completed + 1`.
//!
//! Also owns the operator actions around that state: stall detection,
//! abandoning a batch, and retrying failed enrichments.

use chrono::Duration as ChronoDuration;
use marquee_common::events::IngestEvent;
use marquee_common::time;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::discovery_scheduler::DiscoveryScheduler;
use super::entity_resolver::{EnrichmentOutcome, EntityResolver};
use super::manifest_resolver::ManifestResolver;
use super::manifest_state::{enqueue_manifest_work, transition};
use super::relation_materializer::{MaterializationSummary, RelationMaterializer};
use crate::db::{cursors, enrichment, manifests};
use crate::error::{IngestError, IngestResult};
use crate::models::{BatchStatus, CursorStatus, EntryStatus, ImportManifest, RelationStatus};
use crate::queue::{DISCOVERY_QUEUE, MANIFEST_ENTITIES_QUEUE, MANIFEST_MATERIALIZE_QUEUE};
use crate::IngestContext;

/// Remaining work of one manifest
#[derive(Debug, Clone, Serialize)]
pub struct ManifestPlan {
    pub manifest_id: Uuid,
    pub status: BatchStatus,
    /// Entries that Phase B still has to (re)resolve
    pub entries: Vec<String>,
    /// Relations that Phase C still has to (re)materialize
    pub relations: Vec<String>,
}

impl ManifestPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.relations.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeReport {
    pub manifests: usize,
    pub cursors: usize,
    pub jobs_queued: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StallReport {
    pub cursors: Vec<String>,
    pub manifests: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub upgraded: usize,
    pub still_soft: usize,
    pub failed: usize,
}

pub struct ResumeController {
    ctx: IngestContext,
    resolver: ManifestResolver,
    materializer: RelationMaterializer,
    scheduler: DiscoveryScheduler,
    entities: EntityResolver,
}

impl ResumeController {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            resolver: ManifestResolver::new(ctx.clone()),
            materializer: RelationMaterializer::new(ctx.clone()),
            scheduler: DiscoveryScheduler::new(ctx.clone()),
            entities: EntityResolver::new(ctx.clone()),
            ctx,
        }
    }

    /// What a resume of this manifest would redo
    pub async fn plan_manifest(&self, manifest_id: Uuid) -> IngestResult<ManifestPlan> {
        let manifest = manifests::require_manifest(&self.ctx.db, manifest_id).await?;

        let entries = manifests::load_entities(&self.ctx.db, manifest_id, None)
            .await?
            .into_iter()
            .filter(|e| e.status != EntryStatus::Resolved)
            .map(|e| e.entry_key)
            .collect();

        let relations = manifests::load_relations(&self.ctx.db, manifest_id, None)
            .await?
            .into_iter()
            .filter(|r| r.status != RelationStatus::Created)
            .map(|r| r.relation_key)
            .collect();

        Ok(ManifestPlan {
            manifest_id,
            status: manifest.status,
            entries,
            relations,
        })
    }

    /// Resume one manifest inline: Phase B for the remaining entries, then
    /// Phase C for the remaining relations
    pub async fn resume_manifest(&self, manifest_id: Uuid) -> IngestResult<MaterializationSummary> {
        self.prepare_resume(manifest_id).await?;
        self.resolver.resolve_pending(manifest_id).await?;
        self.materializer.materialize(manifest_id).await
    }

    /// Resume one manifest through the queue
    pub async fn enqueue_manifest_resume(&self, manifest_id: Uuid) -> IngestResult<usize> {
        self.prepare_resume(manifest_id).await?;
        enqueue_manifest_work(&self.ctx, manifest_id).await
    }

    /// Reset failed rows to pending and put the batch back into `resolving`
    async fn prepare_resume(&self, manifest_id: Uuid) -> IngestResult<ImportManifest> {
        let manifest = manifests::require_manifest(&self.ctx.db, manifest_id).await?;

        let entries_reset = manifests::reset_failed_entries(&self.ctx.db, manifest_id).await?;
        let relations_reset = manifests::reset_failed_relations(&self.ctx.db, manifest_id).await?;
        let counts = manifests::summarize(&self.ctx.db, manifest_id).await?;

        let has_work = counts.entities_pending > 0 || counts.relations_pending > 0;
        let reopen = match manifest.status {
            BatchStatus::Resolving => false,
            BatchStatus::Collecting | BatchStatus::Failed => true,
            BatchStatus::Materializing | BatchStatus::Complete => has_work,
        };

        if reopen {
            transition(&self.ctx, &manifest, BatchStatus::Resolving, None).await?;
        }

        info!(
            manifest_id = %manifest_id,
            batch_key = %manifest.batch_key,
            entries_reset,
            relations_reset,
            pending_entries = counts.entities_pending,
            pending_relations = counts.relations_pending,
            "Resuming manifest"
        );

        manifests::require_manifest(&self.ctx.db, manifest_id).await.map_err(IngestError::from)
    }

    /// Re-queue every cursor and non-failed manifest left unfinished
    ///
    /// Run at startup. Failed manifests and stalled cursors wait for an
    /// operator. Dedupe keys make repeated calls harmless.
    pub async fn resume_all(&self) -> IngestResult<ResumeReport> {
        let mut report = ResumeReport::default();

        for manifest in manifests::list_incomplete(&self.ctx.db).await? {
            if manifest.status == BatchStatus::Failed {
                continue;
            }
            report.jobs_queued += enqueue_manifest_work(&self.ctx, manifest.manifest_id).await?;
            report.manifests += 1;
        }

        for cursor in cursors::list_incomplete(&self.ctx.db).await? {
            if cursor.status != CursorStatus::InProgress {
                continue;
            }
            if self.scheduler.schedule(&cursor.stream).await? {
                report.jobs_queued += 1;
            }
            report.cursors += 1;
        }

        info!(
            manifests = report.manifests,
            cursors = report.cursors,
            jobs_queued = report.jobs_queued,
            "Resume pass complete"
        );
        Ok(report)
    }

    /// Put a stalled cursor back to work at `last_completed + 1`
    pub async fn resume_cursor(&self, stream: &str) -> IngestResult<bool> {
        if !cursors::reactivate(&self.ctx.db, stream).await? {
            return Ok(false);
        }
        self.scheduler.schedule(stream).await?;
        info!(stream, "Cursor resumed");
        Ok(true)
    }

    /// Park cursors and fail manifests that made no progress for `threshold`
    ///
    /// Only applies while the matching queues are idle; queued or running work
    /// means the batch is slow, not stuck.
    pub async fn detect_stalled(&self, threshold: Duration) -> IngestResult<StallReport> {
        let threshold = ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::days(1));
        let cutoff = time::to_db(time::now() - threshold);
        let mut report = StallReport::default();

        if self.ctx.queue.counts(DISCOVERY_QUEUE).await?.is_idle() {
            for cursor in cursors::list_idle_since(&self.ctx.db, &cutoff).await? {
                let reason = format!("no progress since {}", time::to_db(cursor.updated_at));
                if cursors::mark_stalled(&self.ctx.db, &cursor.stream, &reason).await? {
                    warn!(stream = %cursor.stream, reason = %reason, "Cursor stalled");
                    self.ctx.event_bus.emit_lossy(IngestEvent::CursorStalled {
                        stream: cursor.stream.clone(),
                        reason,
                        timestamp: chrono::Utc::now(),
                    });
                    report.cursors.push(cursor.stream);
                }
            }
        }

        let entities_idle = self.ctx.queue.counts(MANIFEST_ENTITIES_QUEUE).await?.is_idle();
        let materialize_idle = self.ctx.queue.counts(MANIFEST_MATERIALIZE_QUEUE).await?.is_idle();
        if entities_idle && materialize_idle {
            for manifest in manifests::list_idle_since(&self.ctx.db, &cutoff).await? {
                let reason = format!("stalled: no progress since {}", time::to_db(manifest.updated_at));
                if transition(&self.ctx, &manifest, BatchStatus::Failed, Some(&reason))
                    .await?
                    .is_some()
                {
                    report.manifests.push(manifest.manifest_id);
                }
            }
        }

        Ok(report)
    }

    /// Operator abandon: mark the batch `failed`
    ///
    /// Relations already created stay; nothing is ever half-created.
    pub async fn abandon_manifest(&self, manifest_id: Uuid, reason: &str) -> IngestResult<bool> {
        let manifest = manifests::require_manifest(&self.ctx.db, manifest_id).await?;
        if manifest.status == BatchStatus::Failed {
            return Ok(false);
        }
        let reason = format!("abandoned: {}", reason);
        Ok(transition(&self.ctx, &manifest, BatchStatus::Failed, Some(&reason))
            .await?
            .is_some())
    }

    /// Fail a non-terminal manifest whose queued work ran out of retries
    pub async fn fail_manifest(&self, manifest_id: Uuid, reason: &str) -> IngestResult<bool> {
        let manifest = manifests::require_manifest(&self.ctx.db, manifest_id).await?;
        if manifest.status.is_terminal() {
            return Ok(false);
        }
        Ok(transition(&self.ctx, &manifest, BatchStatus::Failed, Some(reason))
            .await?
            .is_some())
    }

    /// Re-attempt up to `limit` failed detail fetches
    pub async fn retry_enrichment(&self, limit: u32) -> IngestResult<EnrichmentReport> {
        let mut report = EnrichmentReport::default();

        for failure in enrichment::list_unresolved(&self.ctx.db, limit).await? {
            match self.entities.retry_enrichment(&failure).await? {
                EnrichmentOutcome::Upgraded => report.upgraded += 1,
                EnrichmentOutcome::StillSoft => report.still_soft += 1,
                EnrichmentOutcome::Failed(_) => report.failed += 1,
            }
        }

        info!(
            upgraded = report.upgraded,
            still_soft = report.still_soft,
            failed = report.failed,
            "Enrichment retry pass"
        );
        Ok(report)
    }
}
