//! Import manifest state machine
//!
//! A manifest moves COLLECTING → RESOLVING → MATERIALIZING → COMPLETE, or to
//! FAILED from any non-terminal state. FAILED and COMPLETE batches can be
//! reopened into RESOLVING by a resume or by re-collecting new entries.

use chrono::{DateTime, Utc};
use marquee_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::catalog::{EntityKind, ExternalId, ExternalIds};

/// Overall batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Phase A: payload being parsed into the manifest
    Collecting,
    /// Phase B: entity references being resolved
    Resolving,
    /// Phase C: relations being created
    Materializing,
    /// Every entity resolved and every relation created
    Complete,
    /// Needs operator attention (failed entries, failed relations or abandoned)
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Collecting => "collecting",
            BatchStatus::Resolving => "resolving",
            BatchStatus::Materializing => "materializing",
            BatchStatus::Complete => "complete",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::Failed)
    }

    /// Whether the state machine allows `self → next`
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Collecting, Resolving)
                | (Collecting, Failed)
                | (Resolving, Materializing)
                | (Resolving, Failed)
                | (Materializing, Complete)
                | (Materializing, Failed)
                | (Materializing, Resolving)
                | (Complete, Resolving)
                | (Failed, Resolving)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collecting" => Ok(BatchStatus::Collecting),
            "resolving" => Ok(BatchStatus::Resolving),
            "materializing" => Ok(BatchStatus::Materializing),
            "complete" => Ok(BatchStatus::Complete),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown batch status: {}", other))),
        }
    }
}

/// Resolution status of one manifest entity entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Resolved,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Resolved => "resolved",
            EntryStatus::Failed => "failed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "resolved" => Ok(EntryStatus::Resolved),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown entry status: {}", other))),
        }
    }
}

/// Materialization status of one manifest relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationStatus {
    Pending,
    Created,
    Failed,
}

impl RelationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationStatus::Pending => "pending",
            RelationStatus::Created => "created",
            RelationStatus::Failed => "failed",
        }
    }
}

impl FromStr for RelationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RelationStatus::Pending),
            "created" => Ok(RelationStatus::Created),
            "failed" => Ok(RelationStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "Unknown relation status: {}",
                other
            ))),
        }
    }
}

/// Which entity a nomination credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    /// Category credits the movie itself (e.g. Best Picture)
    Movie,
    /// Category credits a person for a movie (e.g. Best Actor)
    Person,
}

impl RelationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationRole::Movie => "movie",
            RelationRole::Person => "person",
        }
    }
}

impl FromStr for RelationRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "movie" => Ok(RelationRole::Movie),
            "person" => Ok(RelationRole::Person),
            other => Err(Error::InvalidInput(format!("Unknown relation role: {}", other))),
        }
    }
}

/// Emitted on every persisted batch status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub manifest_id: Uuid,
    pub batch_key: String,
    pub old_status: BatchStatus,
    pub new_status: BatchStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// One import batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportManifest {
    pub manifest_id: Uuid,
    /// Stable batch identity, e.g. `ceremony:2001`
    pub batch_key: String,
    /// Where the payload came from (`ceremony-api`, `file`, ...)
    pub source: String,
    pub status: BatchStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A distinct external-entity reference needed by a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntity {
    pub manifest_id: Uuid,
    /// `kind:namespace:value`, unique within the manifest
    pub entry_key: String,
    pub kind: EntityKind,
    /// Resolution key chosen from the reference's identifiers
    pub reference: ExternalId,
    pub display_name: String,
    /// Every identifier seen for this reference in the payload
    pub external_ids: ExternalIds,
    pub status: EntryStatus,
    pub entity_guid: Option<Uuid>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestEntity {
    /// References without any identifier are keyed by normalized title
    pub fn is_title_only(&self) -> bool {
        self.reference.namespace == TITLE_NAMESPACE
    }
}

/// Pseudo-namespace for references that carry no external id
pub const TITLE_NAMESPACE: &str = "title";

/// Build the manifest entry key for a reference
pub fn entry_key(kind: EntityKind, reference: &ExternalId) -> String {
    format!("{}:{}:{}", kind, reference.namespace, reference.value)
}

/// A relation (nomination) to create once its entities resolve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRelation {
    pub manifest_id: Uuid,
    /// Uniqueness key: batch, category, role and referenced entries
    pub relation_key: String,
    pub category: String,
    pub role: RelationRole,
    pub nominee_name: String,
    pub movie_entry: String,
    pub person_entry: Option<String>,
    pub won: bool,
    pub details: serde_json::Value,
    pub status: RelationStatus,
    pub relation_guid: Option<Uuid>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestRelation {
    /// Entry keys this relation cannot be created without
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps = vec![self.movie_entry.as_str()];
        if let Some(person) = &self.person_entry {
            deps.push(person.as_str());
        }
        deps
    }
}

/// Build the relation uniqueness key
pub fn relation_key(
    batch_key: &str,
    category: &str,
    role: RelationRole,
    movie_entry: &str,
    person_entry: Option<&str>,
) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        batch_key,
        category.trim(),
        role.as_str(),
        movie_entry,
        person_entry.unwrap_or("-")
    )
}

/// Counts by status, used by the operator views and the resume controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub entities_pending: u64,
    pub entities_resolved: u64,
    pub entities_failed: u64,
    pub relations_pending: u64,
    pub relations_created: u64,
    pub relations_failed: u64,
}

impl ManifestSummary {
    pub fn has_failures(&self) -> bool {
        self.entities_failed > 0 || self.relations_failed > 0
    }

    /// Nothing left for Phase B or Phase C to do
    pub fn is_settled(&self) -> bool {
        self.entities_pending == 0 && self.relations_pending == 0
    }
}
