//! Data models for marquee-ingest

pub mod admission;
pub mod catalog;
pub mod ceremony;
pub mod cursor;
pub mod manifest;
pub mod parameters;

pub use admission::{AdmissionDecision, AdmissionSignals, AdmissionTier};
pub use catalog::{
    primary_external_id, CatalogItem, CatalogPage, Depth, Entity, EntityKind, ExternalId,
    ExternalIds,
};
pub use ceremony::{CeremonyPayload, EntityRef, NormalizedCeremony};
pub use cursor::{CursorStatus, ImportCursor, Partition};
pub use manifest::{
    BatchStatus, EntryStatus, ImportManifest, ManifestEntity, ManifestRelation, ManifestSummary,
    RelationRole, RelationStatus, StatusTransition,
};
pub use parameters::{AdmissionThresholds, ImportParameters};
