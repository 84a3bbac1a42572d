//! Per-item pipeline: admission filter → audit log → entity resolver

use marquee_common::events::IngestEvent;
use tracing::{debug, warn};
use uuid::Uuid;

use super::admission_filter::classify;
use super::entity_resolver::EntityResolver;
use crate::db::admissions;
use crate::error::IngestResult;
use crate::models::{AdmissionTier, CatalogItem};
use crate::IngestContext;

/// What happened to one catalog item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Admitted {
        tier: AdmissionTier,
        entity_guid: Uuid,
        created: bool,
    },
    Rejected {
        reasons: Vec<String>,
    },
    /// No usable external id; nothing can be keyed on it
    Skipped,
}

pub struct ItemPipeline {
    ctx: IngestContext,
    resolver: EntityResolver,
}

impl ItemPipeline {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            resolver: EntityResolver::new(ctx.clone()),
            ctx,
        }
    }

    /// Classify, record the decision, and resolve the item if admitted
    ///
    /// Safe to repeat: the decision log is append-only and resolution is an
    /// upsert.
    pub async fn process_item(
        &self,
        stream: Option<&str>,
        item: &CatalogItem,
    ) -> IngestResult<ItemOutcome> {
        let Some(primary) = self.resolver.resolution_key(item) else {
            warn!(kind = %item.kind, title = %item.title, "Catalog item without external id skipped");
            return Ok(ItemOutcome::Skipped);
        };

        let decision = classify(item, &self.ctx.config.admission);
        admissions::record_decision(&self.ctx.db, item.kind, &primary, &decision, stream).await?;

        if decision.tier == AdmissionTier::Reject {
            debug!(
                kind = %item.kind,
                external_id = %primary,
                reasons = ?decision.reasons,
                "Item rejected"
            );
            self.ctx.event_bus.emit_lossy(IngestEvent::ItemRejected {
                kind: item.kind.to_string(),
                external_id: primary.to_string(),
                reasons: decision.reasons.clone(),
                timestamp: chrono::Utc::now(),
            });
            return Ok(ItemOutcome::Rejected {
                reasons: decision.reasons,
            });
        }

        let Some(outcome) = self.resolver.admit(item, decision.tier).await? else {
            return Ok(ItemOutcome::Rejected {
                reasons: decision.reasons,
            });
        };

        self.ctx.event_bus.emit_lossy(IngestEvent::ItemAdmitted {
            kind: item.kind.to_string(),
            external_id: primary.to_string(),
            tier: decision.tier.as_str().to_string(),
            entity_guid: outcome.entity.guid,
            timestamp: chrono::Utc::now(),
        });

        Ok(ItemOutcome::Admitted {
            tier: decision.tier,
            entity_guid: outcome.entity.guid,
            created: outcome.created,
        })
    }
}
