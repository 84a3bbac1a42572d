//! Ceremony import: Phase A (collect) and the inline A → B → C driver
//!
//! **Phase A** parses the payload into its tagged shape, normalizes it, and
//! persists the whole manifest in one transaction. No entity or relation is
//! written. A malformed payload fails the batch here, before anything else.
//!
//! Phases B and C then run either inline ([`CeremonyImporter::import_payload`])
//! or through the queue ([`CeremonyImporter::stage_payload`]).

use marquee_common::events::IngestEvent;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use super::manifest_builder::collect;
use super::manifest_resolver::{ManifestResolver, ResolutionSummary};
use super::manifest_state::enqueue_manifest_work;
use super::relation_materializer::{MaterializationSummary, RelationMaterializer};
use crate::db::manifests::{self, PersistOutcome};
use crate::error::{IngestError, IngestResult};
use crate::models::{BatchStatus, CeremonyPayload};
use crate::IngestContext;

/// Source label for payloads fetched from the ceremony API
pub const CEREMONY_API_SOURCE: &str = "ceremony-api";

/// Outcome of a full inline import
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub manifest_id: Uuid,
    pub batch_key: String,
    pub new_entities: u64,
    pub new_relations: u64,
    pub entities_resolved: usize,
    pub entities_failed: usize,
    pub materialization: MaterializationSummary,
}

pub struct CeremonyImporter {
    ctx: IngestContext,
    resolver: ManifestResolver,
    materializer: RelationMaterializer,
}

impl CeremonyImporter {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            resolver: ManifestResolver::new(ctx.clone()),
            materializer: RelationMaterializer::new(ctx.clone()),
            ctx,
        }
    }

    /// Phase A: parse, normalize, and persist the manifest
    ///
    /// `hint_key` names the batch if the payload is too broken to carry its own
    /// ceremony id.
    pub async fn collect_payload(
        &self,
        source: &str,
        hint_key: &str,
        payload: &serde_json::Value,
    ) -> IngestResult<PersistOutcome> {
        let normalized = match CeremonyPayload::parse(payload, hint_key).and_then(|p| p.normalize()) {
            Ok(normalized) => normalized,
            Err(e) => {
                self.fail_batch(source, &e).await?;
                return Err(e);
            }
        };

        let batch = collect(&normalized, &self.ctx.config.import.namespace_priority);
        let outcome = manifests::persist_manifest(
            &self.ctx.db,
            &batch.batch_key,
            source,
            &batch.entities,
            &batch.relations,
        )
        .await?;

        info!(
            manifest_id = %outcome.manifest_id,
            batch_key = %batch.batch_key,
            entities = batch.entities.len(),
            relations = batch.relations.len(),
            new_entities = outcome.new_entities,
            new_relations = outcome.new_relations,
            "Manifest collected"
        );

        if outcome.previous_status != Some(outcome.status) {
            self.ctx.event_bus.emit_lossy(IngestEvent::ManifestStatusChanged {
                manifest_id: outcome.manifest_id,
                batch_key: batch.batch_key.clone(),
                old_status: outcome
                    .previous_status
                    .unwrap_or(BatchStatus::Collecting)
                    .to_string(),
                new_status: outcome.status.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }

        Ok(outcome)
    }

    /// Run all three phases inline
    pub async fn import_payload(
        &self,
        source: &str,
        hint_key: &str,
        payload: &serde_json::Value,
    ) -> IngestResult<ImportReport> {
        let staged = self.collect_payload(source, hint_key, payload).await?;
        let resolution: ResolutionSummary = self.resolver.resolve_pending(staged.manifest_id).await?;
        let materialization = self.materializer.materialize(staged.manifest_id).await?;

        let manifest = manifests::require_manifest(&self.ctx.db, staged.manifest_id).await?;
        Ok(ImportReport {
            manifest_id: staged.manifest_id,
            batch_key: manifest.batch_key,
            new_entities: staged.new_entities,
            new_relations: staged.new_relations,
            entities_resolved: resolution.resolved,
            entities_failed: resolution.failed,
            materialization,
        })
    }

    /// Fetch a ceremony from the ceremony source and import it inline
    pub async fn import_ceremony(&self, ceremony_key: &str) -> IngestResult<ImportReport> {
        let payload = self.ctx.ceremonies.fetch_ceremony(ceremony_key).await?;
        self.import_payload(CEREMONY_API_SOURCE, ceremony_key, &payload).await
    }

    /// Phase A now; Phases B and C as queued jobs
    pub async fn stage_payload(
        &self,
        source: &str,
        hint_key: &str,
        payload: &serde_json::Value,
    ) -> IngestResult<PersistOutcome> {
        let outcome = self.collect_payload(source, hint_key, payload).await?;
        let queued = enqueue_manifest_work(&self.ctx, outcome.manifest_id).await?;
        info!(manifest_id = %outcome.manifest_id, queued, "Manifest work queued");
        Ok(outcome)
    }

    async fn fail_batch(&self, source: &str, cause: &IngestError) -> IngestResult<()> {
        let IngestError::MalformedPayload { batch_key, reason } = cause else {
            return Ok(());
        };

        error!(batch_key = %batch_key, reason = %reason, "Malformed ceremony payload");
        if let Some(manifest_id) =
            manifests::record_failed_batch(&self.ctx.db, batch_key, source, reason).await?
        {
            self.ctx.event_bus.emit_lossy(IngestEvent::ManifestFailed {
                manifest_id,
                batch_key: batch_key.clone(),
                reason: reason.clone(),
                timestamp: chrono::Utc::now(),
            });
        }
        Ok(())
    }
}
