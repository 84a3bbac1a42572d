//! Batch status transitions and outstanding-work scheduling
//!
//! Every status change goes through [`transition`]: the state machine is
//! checked first, then the change is applied as a compare-and-set, then the
//! event is broadcast. Losing the compare-and-set is not an error; some other
//! worker applied a transition first.

use marquee_common::events::IngestEvent;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::manifests;
use crate::error::{IngestError, IngestResult};
use crate::models::{BatchStatus, EntryStatus, ImportManifest, StatusTransition};
use crate::queue::JobPayload;
use crate::IngestContext;

/// Move `manifest` from its current status to `to`
///
/// Returns the applied transition, or `None` if the stored status had already
/// moved on.
pub async fn transition(
    ctx: &IngestContext,
    manifest: &ImportManifest,
    to: BatchStatus,
    reason: Option<&str>,
) -> IngestResult<Option<StatusTransition>> {
    if !manifest.status.can_transition_to(to) {
        return Err(IngestError::InvalidTransition {
            from: manifest.status.to_string(),
            to: to.to_string(),
        });
    }

    let error = if to == BatchStatus::Failed { reason } else { None };
    if !manifests::set_status(&ctx.db, manifest.manifest_id, manifest.status, to, error).await? {
        return Ok(None);
    }

    let applied = StatusTransition {
        manifest_id: manifest.manifest_id,
        batch_key: manifest.batch_key.clone(),
        old_status: manifest.status,
        new_status: to,
        transitioned_at: chrono::Utc::now(),
    };

    info!(
        manifest_id = %manifest.manifest_id,
        batch_key = %manifest.batch_key,
        from = %manifest.status,
        to = %to,
        "Manifest status changed"
    );

    ctx.event_bus.emit_lossy(IngestEvent::ManifestStatusChanged {
        manifest_id: applied.manifest_id,
        batch_key: applied.batch_key.clone(),
        old_status: applied.old_status.to_string(),
        new_status: applied.new_status.to_string(),
        timestamp: applied.transitioned_at,
    });

    if to == BatchStatus::Failed {
        let reason = reason.unwrap_or("unspecified").to_string();
        error!(manifest_id = %manifest.manifest_id, batch_key = %manifest.batch_key, reason = %reason, "Manifest failed");
        ctx.event_bus.emit_lossy(IngestEvent::ManifestFailed {
            manifest_id: manifest.manifest_id,
            batch_key: manifest.batch_key.clone(),
            reason,
            timestamp: applied.transitioned_at,
        });
    }

    Ok(Some(applied))
}

/// Queue the outstanding work of a manifest
///
/// One `ResolveManifestEntity` job per pending entry, or a single
/// `MaterializeManifest` job once no entry is pending. Dedupe keys make this
/// safe to call repeatedly. Returns the number of jobs queued.
pub async fn enqueue_manifest_work(ctx: &IngestContext, manifest_id: Uuid) -> IngestResult<usize> {
    let pending = manifests::load_entities(&ctx.db, manifest_id, Some(EntryStatus::Pending)).await?;

    if pending.is_empty() {
        return Ok(usize::from(enqueue_materialize(ctx, manifest_id).await?));
    }

    let mut queued = 0;
    for entry in pending {
        let dedupe_key = format!("entry:{}:{}", manifest_id, entry.entry_key);
        if ctx
            .queue
            .enqueue(
                &JobPayload::ResolveManifestEntity {
                    manifest_id,
                    entry_key: entry.entry_key,
                },
                Some(&dedupe_key),
            )
            .await?
        {
            queued += 1;
        }
    }
    Ok(queued)
}

/// Queue Phase C if no entry of the manifest is still pending
///
/// Each entry job calls this after settling its entry, so whichever job
/// settles the last entry hands the batch over to Phase C.
pub async fn materialize_when_resolved(ctx: &IngestContext, manifest_id: Uuid) -> IngestResult<bool> {
    let pending = manifests::load_entities(&ctx.db, manifest_id, Some(EntryStatus::Pending)).await?;
    if !pending.is_empty() {
        return Ok(false);
    }
    enqueue_materialize(ctx, manifest_id).await
}

async fn enqueue_materialize(ctx: &IngestContext, manifest_id: Uuid) -> IngestResult<bool> {
    let queued = ctx
        .queue
        .enqueue(
            &JobPayload::MaterializeManifest { manifest_id },
            Some(&format!("materialize:{}", manifest_id)),
        )
        .await?;
    Ok(queued)
}
