//! Phase C: Relation Materializer
//!
//! Creates nominations whose dependencies have all resolved. The dependency
//! check and the insert share one write transaction (see
//! [`nominations::materialize_relation`]), and `nominations.relation_key` is
//! unique, so re-running a completed manifest creates nothing.
//!
//! A relation may be materialized as soon as its own entries are resolved,
//! even while other entries of the batch are still pending. The batch itself
//! only leaves `resolving` once no entry is pending.

use marquee_common::events::IngestEvent;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manifest_state::transition;
use crate::db::manifests;
use crate::db::nominations::{self, RelationOutcome};
use crate::error::{IngestError, IngestResult};
use crate::models::{BatchStatus, RelationStatus};
use crate::IngestContext;

/// Per-manifest report of one materialization pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializationSummary {
    pub manifest_id: Uuid,
    /// Relations written by this pass
    pub created: usize,
    /// Relations found already written
    pub already_present: usize,
    /// Relations whose dependencies are still pending
    pub waiting: usize,
    /// `(relation_key, reason)` for relations recorded failed in this pass
    pub failed: Vec<(String, String)>,
    /// Entries still pending after the pass
    pub entities_unresolved: u64,
    pub status: Option<BatchStatus>,
}

pub struct RelationMaterializer {
    ctx: IngestContext,
}

impl RelationMaterializer {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    /// Create every relation that is ready; returns the pass summary
    pub async fn materialize(&self, manifest_id: Uuid) -> IngestResult<MaterializationSummary> {
        let mut manifest = manifests::require_manifest(&self.ctx.db, manifest_id).await?;
        let mut summary = MaterializationSummary {
            manifest_id,
            ..Default::default()
        };

        match manifest.status {
            BatchStatus::Collecting => {
                return Err(IngestError::InvalidTransition {
                    from: manifest.status.to_string(),
                    to: BatchStatus::Materializing.to_string(),
                })
            }
            BatchStatus::Failed => {
                debug!(manifest_id = %manifest_id, "Manifest failed or abandoned, nothing to materialize");
                summary.status = Some(manifest.status);
                return Ok(summary);
            }
            BatchStatus::Resolving => {
                let counts = manifests::summarize(&self.ctx.db, manifest_id).await?;
                if counts.entities_pending == 0 {
                    transition(&self.ctx, &manifest, BatchStatus::Materializing, None).await?;
                    manifest = manifests::require_manifest(&self.ctx.db, manifest_id).await?;
                }
            }
            BatchStatus::Materializing | BatchStatus::Complete => {}
        }

        let pending =
            manifests::load_relations(&self.ctx.db, manifest_id, Some(RelationStatus::Pending))
                .await?;

        for relation in &pending {
            let outcome = nominations::materialize_relation(
                &self.ctx.db,
                &manifest,
                &relation.relation_key,
            )
            .await?;

            match outcome {
                RelationOutcome::Created(_) => summary.created += 1,
                RelationOutcome::AlreadyPresent(_) => summary.already_present += 1,
                RelationOutcome::Waiting(_) => summary.waiting += 1,
                RelationOutcome::Failed(reason) => {
                    warn!(
                        manifest_id = %manifest_id,
                        relation_key = %relation.relation_key,
                        reason = %reason,
                        "Relation failed"
                    );
                    summary.failed.push((relation.relation_key.clone(), reason));
                }
            }
        }

        let counts = manifests::summarize(&self.ctx.db, manifest_id).await?;
        summary.entities_unresolved = counts.entities_pending;

        let mut status = manifest.status;
        if manifest.status == BatchStatus::Materializing && counts.is_settled() {
            let (next, reason) = if counts.has_failures() {
                (
                    BatchStatus::Failed,
                    Some(format!(
                        "{} entities and {} relations failed",
                        counts.entities_failed, counts.relations_failed
                    )),
                )
            } else {
                (BatchStatus::Complete, None)
            };

            if transition(&self.ctx, &manifest, next, reason.as_deref()).await?.is_some() {
                status = next;
            }
        }
        summary.status = Some(status);

        if summary.created > 0 || !summary.failed.is_empty() {
            info!(
                manifest_id = %manifest_id,
                batch_key = %manifest.batch_key,
                created = summary.created,
                failed = summary.failed.len(),
                waiting = summary.waiting,
                "Relations materialized"
            );
        }

        self.ctx.event_bus.emit_lossy(IngestEvent::RelationsMaterialized {
            manifest_id,
            created: summary.created,
            failed: summary.failed.len(),
            waiting: summary.waiting,
            timestamp: chrono::Utc::now(),
        });

        Ok(summary)
    }
}
