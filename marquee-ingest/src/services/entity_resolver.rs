//! Entity Resolver
//!
//! Idempotent create-or-fetch for one entity keyed by its resolution id. The
//! existence check is the storage layer's `ON CONFLICT` claim in
//! [`entities::upsert_entity`]; nothing here reads before it writes, so any
//! number of workers may resolve the same id at once and all of them read back
//! the same row.
//!
//! **Failure handling:** when a full detail fetch fails the item is stored as a
//! `soft` placeholder and an `enrichment_failures` row is written, so a later
//! [`EntityResolver::retry_enrichment`] can upgrade it.

use marquee_common::Error;
use tracing::{debug, info, warn};

use super::admission_filter::{classify, floor_to_soft};
use crate::db::entities::{self, NewEntity, UpsertOutcome};
use crate::db::{admissions, enrichment};
use crate::db::enrichment::EnrichmentFailure;
use crate::error::{IngestResult, SourceError};
use crate::models::{
    catalog::clean_external_ids, primary_external_id, AdmissionTier, CatalogItem, Depth, Entity,
    ExternalId, ManifestEntity,
};
use crate::utils::retry_on_lock;
use crate::IngestContext;

/// Outcome of resolving a manifest reference
#[derive(Debug, Clone)]
pub enum ReferenceResolution {
    Resolved(Entity),
    /// The source does not know the id; the entry cannot resolve
    Unresolvable(String),
}

/// Outcome of re-attempting a failed enrichment
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentOutcome {
    /// Fetched and classified full; the entity is now full depth
    Upgraded,
    /// Fetched, but the item does not qualify for full depth
    StillSoft,
    /// The fetch failed again
    Failed(String),
}

pub struct EntityResolver {
    ctx: IngestContext,
}

impl EntityResolver {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    /// Resolution key for a set of identifiers
    pub fn resolution_key(&self, item: &CatalogItem) -> Option<ExternalId> {
        primary_external_id(
            &clean_external_ids(&item.external_ids),
            &self.ctx.config.import.namespace_priority,
        )
    }

    /// Create the entity if its resolution key is unclaimed, otherwise return
    /// the existing one (upgrading `soft → full` when `depth` is full)
    pub async fn resolve_or_create(
        &self,
        item: &CatalogItem,
        depth: Depth,
    ) -> IngestResult<UpsertOutcome> {
        let external_ids = clean_external_ids(&item.external_ids);
        let primary = primary_external_id(&external_ids, &self.ctx.config.import.namespace_priority)
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} '{}' has no external id", item.kind, item.title))
            })?;

        let title = if item.title.trim().is_empty() {
            primary.to_string()
        } else {
            item.title.trim().to_string()
        };

        let new = NewEntity {
            kind: item.kind,
            primary,
            external_ids,
            title,
            depth,
            raw_payload: item.raw.clone(),
        };

        let outcome = retry_on_lock("entity upsert", self.ctx.config.max_lock_wait_ms, || {
            entities::upsert_entity(&self.ctx.db, &new)
        })
        .await?;

        if outcome.created || outcome.upgraded {
            debug!(
                kind = %new.kind,
                external_id = %new.primary,
                guid = %outcome.entity.guid,
                created = outcome.created,
                upgraded = outcome.upgraded,
                depth = outcome.entity.depth.as_str(),
                "Entity resolved"
            );
        }

        Ok(outcome)
    }

    /// Materialize an admitted catalog item at its tier
    ///
    /// `Full` fetches detail first; if that fetch fails the item is stored soft
    /// and queued for enrichment. `Reject` creates nothing.
    pub async fn admit(
        &self,
        item: &CatalogItem,
        tier: AdmissionTier,
    ) -> IngestResult<Option<UpsertOutcome>> {
        match tier {
            AdmissionTier::Reject => Ok(None),
            AdmissionTier::Soft => Ok(Some(self.resolve_or_create(item, Depth::Soft).await?)),
            AdmissionTier::Full => {
                let primary = self.resolution_key(item).ok_or_else(|| {
                    Error::InvalidInput(format!("{} '{}' has no external id", item.kind, item.title))
                })?;

                match self.ctx.catalog.fetch_detail(item.kind, &primary).await {
                    Ok(detail) => {
                        let merged = item.clone().merged_with(detail);
                        let outcome = self.resolve_or_create(&merged, Depth::Full).await?;
                        enrichment::mark_resolved(&self.ctx.db, item.kind, &primary).await?;
                        Ok(Some(outcome))
                    }
                    Err(e) => {
                        let outcome = self.store_placeholder(item, &primary, &e).await?;
                        Ok(Some(outcome))
                    }
                }
            }
        }
    }

    /// Resolve one manifest reference
    ///
    /// A reference already held at full depth is returned without touching
    /// the source. Otherwise the detail is fetched and classified; payload
    /// references are always admitted, at least as soft.
    pub async fn resolve_reference(
        &self,
        entry: &ManifestEntity,
    ) -> IngestResult<ReferenceResolution> {
        let existing =
            entities::find_by_external_id(&self.ctx.db, entry.kind, &entry.reference).await?;

        if let Some(entity) = &existing {
            if entity.depth == Depth::Full {
                return Ok(ReferenceResolution::Resolved(entity.clone()));
            }
        }

        let base = CatalogItem::placeholder(entry.kind, &entry.display_name, entry.external_ids.clone());

        match self.ctx.catalog.fetch_detail(entry.kind, &entry.reference).await {
            Ok(detail) => {
                let merged = base.merged_with(detail);
                let decision = floor_to_soft(classify(&merged, &self.ctx.config.admission));
                admissions::record_decision(&self.ctx.db, entry.kind, &entry.reference, &decision, None)
                    .await?;

                let depth = decision.tier.depth().unwrap_or(Depth::Soft);
                let outcome = self.resolve_or_create(&merged, depth).await?;
                enrichment::mark_resolved(&self.ctx.db, entry.kind, &entry.reference).await?;
                Ok(ReferenceResolution::Resolved(outcome.entity))
            }
            Err(SourceError::NotFound(what)) => match existing {
                Some(entity) => Ok(ReferenceResolution::Resolved(entity)),
                None => Ok(ReferenceResolution::Unresolvable(format!(
                    "{} not found in catalog ({})",
                    entry.reference, what
                ))),
            },
            Err(e) => match existing {
                Some(entity) => {
                    enrichment::record_failure(
                        &self.ctx.db,
                        entry.kind,
                        &entry.reference,
                        entity.guid,
                        &e.to_string(),
                    )
                    .await?;
                    Ok(ReferenceResolution::Resolved(entity))
                }
                None => {
                    let outcome = self.store_placeholder(&base, &entry.reference, &e).await?;
                    Ok(ReferenceResolution::Resolved(outcome.entity))
                }
            },
        }
    }

    /// Re-attempt one failed detail fetch
    pub async fn retry_enrichment(&self, failure: &EnrichmentFailure) -> IngestResult<EnrichmentOutcome> {
        let detail = match self
            .ctx
            .catalog
            .fetch_detail(failure.kind, &failure.external_id)
            .await
        {
            Ok(detail) => detail,
            Err(e) => {
                enrichment::record_failure(
                    &self.ctx.db,
                    failure.kind,
                    &failure.external_id,
                    failure.entity_guid,
                    &e.to_string(),
                )
                .await?;
                return Ok(EnrichmentOutcome::Failed(e.to_string()));
            }
        };

        let mut item = detail;
        item.external_ids
            .entry(failure.external_id.namespace.clone())
            .or_insert_with(|| failure.external_id.value.clone());

        let decision = classify(&item, &self.ctx.config.admission);
        admissions::record_decision(&self.ctx.db, failure.kind, &failure.external_id, &decision, None)
            .await?;

        let outcome = match decision.tier {
            AdmissionTier::Full => {
                self.resolve_or_create(&item, Depth::Full).await?;
                EnrichmentOutcome::Upgraded
            }
            _ => EnrichmentOutcome::StillSoft,
        };

        enrichment::mark_resolved(&self.ctx.db, failure.kind, &failure.external_id).await?;
        info!(
            kind = %failure.kind,
            external_id = %failure.external_id,
            outcome = ?outcome,
            "Enrichment retried"
        );
        Ok(outcome)
    }

    async fn store_placeholder(
        &self,
        item: &CatalogItem,
        primary: &ExternalId,
        cause: &SourceError,
    ) -> IngestResult<UpsertOutcome> {
        warn!(
            kind = %item.kind,
            external_id = %primary,
            error = %cause,
            "Detail fetch failed, storing soft placeholder"
        );

        let outcome = self.resolve_or_create(item, Depth::Soft).await?;
        enrichment::record_failure(
            &self.ctx.db,
            item.kind,
            primary,
            outcome.entity.guid,
            &cause.to_string(),
        )
        .await?;
        Ok(outcome)
    }
}
