//! Admission tiers and decisions

use chrono::{DateTime, Utc};
use marquee_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::catalog::{CatalogItem, Depth, EntityKind, ExternalId};

/// How much work to spend materializing a catalog item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionTier {
    /// Detail fetch and full entity
    Full,
    /// Minimal entity so relations can reference it
    Soft,
    /// Dropped; only the decision is recorded
    Reject,
}

impl AdmissionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionTier::Full => "full",
            AdmissionTier::Soft => "soft",
            AdmissionTier::Reject => "reject",
        }
    }

    /// Entity depth for an admitted tier
    pub fn depth(&self) -> Option<Depth> {
        match self {
            AdmissionTier::Full => Some(Depth::Full),
            AdmissionTier::Soft => Some(Depth::Soft),
            AdmissionTier::Reject => None,
        }
    }
}

impl FromStr for AdmissionTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(AdmissionTier::Full),
            "soft" => Ok(AdmissionTier::Soft),
            "reject" => Ok(AdmissionTier::Reject),
            other => Err(Error::InvalidInput(format!("Unknown admission tier: {}", other))),
        }
    }
}

/// The inputs the filter looks at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionSignals {
    pub has_image: bool,
    pub has_release_date: bool,
    pub popularity: Option<f64>,
    pub vote_count: Option<u32>,
}

impl AdmissionSignals {
    pub fn from_item(item: &CatalogItem) -> Self {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        Self {
            has_image: present(&item.image_path),
            has_release_date: present(&item.release_date),
            popularity: item.popularity.filter(|p| p.is_finite()),
            vote_count: item.vote_count,
        }
    }
}

/// Output of `classify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub tier: AdmissionTier,
    pub signals: AdmissionSignals,
    /// Why the item did not reach a higher tier; empty for `full`
    pub reasons: Vec<String>,
}

/// A persisted admission decision
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionRecord {
    pub id: i64,
    pub kind: EntityKind,
    pub external_id: ExternalId,
    pub tier: AdmissionTier,
    pub signals: AdmissionSignals,
    pub reasons: Vec<String>,
    pub stream: Option<String>,
    pub decided_at: DateTime<Utc>,
}
