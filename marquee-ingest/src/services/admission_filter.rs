//! Quality admission filter
//!
//! Pure classification of a catalog item into `full`, `soft` or `reject`
//! from four signals: image reference, release date, popularity and vote
//! count. Thresholds come from configuration.
//!
//! - `full`: every signal present and over its threshold
//! - `soft`: popularity over the soft threshold and an image or a date
//! - `reject`: anything else
//!
//! A missing vote count never reaches `full`.

use crate::models::{
    AdmissionDecision, AdmissionSignals, AdmissionThresholds, AdmissionTier, CatalogItem,
    EntityKind,
};

/// Classify one item; deterministic for fixed thresholds and signals
pub fn classify(item: &CatalogItem, thresholds: &AdmissionThresholds) -> AdmissionDecision {
    let signals = AdmissionSignals::from_item(item);

    let full_gaps = full_gaps(item.kind, &signals, thresholds);
    if full_gaps.is_empty() {
        return AdmissionDecision {
            tier: AdmissionTier::Full,
            signals,
            reasons: Vec::new(),
        };
    }

    let soft_gaps = soft_gaps(&signals, thresholds);
    let tier = if soft_gaps.is_empty() {
        AdmissionTier::Soft
    } else {
        AdmissionTier::Reject
    };

    let mut reasons = full_gaps;
    reasons.extend(soft_gaps);

    AdmissionDecision {
        tier,
        signals,
        reasons,
    }
}

/// Ceremony references are needed by relations, so they are never dropped
pub fn floor_to_soft(decision: AdmissionDecision) -> AdmissionDecision {
    if decision.tier != AdmissionTier::Reject {
        return decision;
    }
    let mut reasons = decision.reasons;
    reasons.push("referenced by a relation, admitted as soft".to_string());
    AdmissionDecision {
        tier: AdmissionTier::Soft,
        signals: decision.signals,
        reasons,
    }
}

fn full_gaps(
    kind: EntityKind,
    signals: &AdmissionSignals,
    thresholds: &AdmissionThresholds,
) -> Vec<String> {
    let mut gaps = Vec::new();

    if thresholds.require_image_for_full && !signals.has_image {
        gaps.push("missing image reference".to_string());
    }
    if kind == EntityKind::Movie
        && thresholds.require_release_date_for_full
        && !signals.has_release_date
    {
        gaps.push("missing release date".to_string());
    }

    match signals.popularity {
        Some(p) if p >= thresholds.full_min_popularity => {}
        Some(p) => gaps.push(format!(
            "popularity {} below full threshold {}",
            p, thresholds.full_min_popularity
        )),
        None => gaps.push("missing popularity".to_string()),
    }

    match signals.vote_count {
        Some(v) if v >= thresholds.full_min_votes => {}
        Some(v) => gaps.push(format!(
            "vote count {} below full threshold {}",
            v, thresholds.full_min_votes
        )),
        None => gaps.push("missing vote count".to_string()),
    }

    gaps
}

fn soft_gaps(signals: &AdmissionSignals, thresholds: &AdmissionThresholds) -> Vec<String> {
    let mut gaps = Vec::new();

    let popularity = signals.popularity.unwrap_or(0.0);
    if popularity < thresholds.soft_min_popularity {
        gaps.push(format!(
            "popularity {} below soft threshold {}",
            popularity, thresholds.soft_min_popularity
        ));
    }
    if !signals.has_image && !signals.has_release_date {
        gaps.push("no image reference and no release date".to_string());
    }

    gaps
}
