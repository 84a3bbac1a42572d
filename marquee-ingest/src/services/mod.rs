//! Import engine services

pub mod admission_filter;
pub mod catalog_client;
pub mod ceremony_client;
pub mod ceremony_importer;
pub mod discovery_scheduler;
pub mod entity_resolver;
pub mod fuzzy_matcher;
pub mod item_pipeline;
pub mod manifest_builder;
pub mod manifest_resolver;
pub mod manifest_state;
pub mod rate_limiter;
pub mod relation_materializer;
pub mod resume_controller;
pub mod sources;

pub use admission_filter::{classify, floor_to_soft};
pub use catalog_client::HttpCatalogClient;
pub use ceremony_client::{FileCeremonySource, HttpCeremonyClient};
pub use ceremony_importer::{CeremonyImporter, ImportReport};
pub use discovery_scheduler::{DiscoveryOutcome, DiscoveryScheduler};
pub use entity_resolver::{EnrichmentOutcome, EntityResolver, ReferenceResolution};
pub use fuzzy_matcher::FuzzyOutcome;
pub use item_pipeline::{ItemOutcome, ItemPipeline};
pub use manifest_resolver::{EntryOutcome, ManifestResolver, ResolutionSummary};
pub use rate_limiter::SourceRateLimiter;
pub use relation_materializer::{MaterializationSummary, RelationMaterializer};
pub use resume_controller::{ManifestPlan, ResumeController, ResumeReport, StallReport};
pub use sources::{CatalogSource, CeremonySource, ListingQuery, OfflineCatalog};
