//! Phase B: resolve manifest entity entries
//!
//! Entries are independent, so they are resolved with bounded parallelism.
//! Each entry moves `pending → resolved | failed` exactly once (both updates
//! are conditional on `pending`); a redelivered job for a settled entry is a
//! no-op that never reaches the external source.

use futures::stream::{self, StreamExt};
use marquee_common::Error;
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::entity_resolver::{EntityResolver, ReferenceResolution};
use super::fuzzy_matcher::{best_candidate, normalize_title, FuzzyOutcome};
use crate::db::{entities, manifests};
use crate::error::IngestResult;
use crate::models::{EntryStatus, ManifestEntity};
use crate::IngestContext;

/// What resolving one entry did
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Resolved(Uuid),
    Failed(String),
    /// The entry was already terminal; nothing was done
    AlreadySettled(EntryStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub resolved: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ManifestResolver {
    ctx: IngestContext,
    resolver: EntityResolver,
}

impl ManifestResolver {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            resolver: EntityResolver::new(ctx.clone()),
            ctx,
        }
    }

    /// Resolve every entry still `pending`
    pub async fn resolve_pending(&self, manifest_id: Uuid) -> IngestResult<ResolutionSummary> {
        let pending =
            manifests::load_entities(&self.ctx.db, manifest_id, Some(EntryStatus::Pending)).await?;
        let parallelism = self.ctx.config.import.parallelism.max(1);

        debug!(manifest_id = %manifest_id, pending = pending.len(), parallelism, "Phase B starting");

        let results: Vec<IngestResult<EntryOutcome>> = stream::iter(pending)
            .map(|entry| async move { self.resolve_loaded(&entry).await })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut summary = ResolutionSummary::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(EntryOutcome::Resolved(_)) => summary.resolved += 1,
                Ok(EntryOutcome::Failed(_)) => summary.failed += 1,
                Ok(EntryOutcome::AlreadySettled(_)) => summary.skipped += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        manifests::touch(&self.ctx.db, manifest_id).await?;

        // Absorbed outcomes are already recorded; only storage trouble escapes
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(
            manifest_id = %manifest_id,
            resolved = summary.resolved,
            failed = summary.failed,
            skipped = summary.skipped,
            "Phase B pass done"
        );
        Ok(summary)
    }

    /// Resolve one entry by key
    pub async fn resolve_entry(&self, manifest_id: Uuid, entry_key: &str) -> IngestResult<EntryOutcome> {
        let entry = manifests::load_entity_entry(&self.ctx.db, manifest_id, entry_key)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("manifest {} entry {}", manifest_id, entry_key))
            })?;
        self.resolve_loaded(&entry).await
    }

    /// Record a terminal failure for an entry whose retry budget ran out
    pub async fn fail_entry(&self, manifest_id: Uuid, entry_key: &str, reason: &str) -> IngestResult<bool> {
        let failed = manifests::mark_entry_failed(&self.ctx.db, manifest_id, entry_key, reason).await?;
        if failed {
            warn!(manifest_id = %manifest_id, entry_key, reason, "Manifest entry failed");
        }
        Ok(failed)
    }

    async fn resolve_loaded(&self, entry: &ManifestEntity) -> IngestResult<EntryOutcome> {
        if entry.status != EntryStatus::Pending {
            return Ok(EntryOutcome::AlreadySettled(entry.status));
        }

        manifests::record_entry_attempt(&self.ctx.db, entry.manifest_id, &entry.entry_key).await?;

        let resolution = if entry.is_title_only() {
            self.match_title(entry).await?
        } else {
            self.resolver.resolve_reference(entry).await?
        };

        match resolution {
            ReferenceResolution::Resolved(entity) => {
                manifests::mark_entry_resolved(
                    &self.ctx.db,
                    entry.manifest_id,
                    &entry.entry_key,
                    entity.guid,
                )
                .await?;
                debug!(entry_key = %entry.entry_key, guid = %entity.guid, "Manifest entry resolved");
                Ok(EntryOutcome::Resolved(entity.guid))
            }
            ReferenceResolution::Unresolvable(reason) => {
                self.fail_entry(entry.manifest_id, &entry.entry_key, &reason).await?;
                Ok(EntryOutcome::Failed(reason))
            }
        }
    }

    /// Fuzzy fallback for references with no external id
    async fn match_title(&self, entry: &ManifestEntity) -> IngestResult<ReferenceResolution> {
        let threshold = self.ctx.config.import.fuzzy_match_threshold;
        let unresolvable = |outcome: FuzzyOutcome| {
            ReferenceResolution::Unresolvable(
                outcome
                    .failure_reason(&entry.display_name)
                    .unwrap_or_else(|| format!("'{}' could not be matched", entry.display_name)),
            )
        };

        if threshold.is_none() {
            return Ok(unresolvable(FuzzyOutcome::Disabled));
        }

        // Stored titles keep their leading article, normalized ones drop it
        let initials: BTreeSet<char> = [
            entry.display_name.trim().to_lowercase().chars().next(),
            normalize_title(&entry.display_name).chars().next(),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut candidates = Vec::new();
        for initial in initials {
            for candidate in entities::title_candidates(&self.ctx.db, entry.kind, initial).await? {
                if !candidates.iter().any(|(guid, _)| *guid == candidate.0) {
                    candidates.push(candidate);
                }
            }
        }

        match best_candidate(&entry.display_name, &candidates, threshold) {
            FuzzyOutcome::Matched { guid, score } => {
                match entities::load_entity(&self.ctx.db, guid).await? {
                    Some(entity) => {
                        debug!(title = %entry.display_name, guid = %guid, score, "Fuzzy title match");
                        Ok(ReferenceResolution::Resolved(entity))
                    }
                    None => Ok(unresolvable(FuzzyOutcome::NoMatch { best: Some(score) })),
                }
            }
            other => Ok(unresolvable(other)),
        }
    }
}
