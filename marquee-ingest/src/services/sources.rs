//! External source seams
//!
//! The engine only talks to catalogs and ceremony feeds through these traits.
//! Both operations must be safe to retry: neither has side effects.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::models::{CatalogItem, CatalogPage, EntityKind, ExternalId};

/// One listing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub kind: EntityKind,
    /// 1-based listing page
    pub page: u32,
    /// Restrict the listing to one release year
    pub year: Option<i32>,
}

/// Paginated movie/person catalog
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch one listing page
    async fn list_page(&self, query: &ListingQuery) -> Result<CatalogPage, SourceError>;

    /// Fetch full details for one item
    async fn fetch_detail(
        &self,
        kind: EntityKind,
        id: &ExternalId,
    ) -> Result<CatalogItem, SourceError>;
}

/// Award ceremony payload feed
#[async_trait]
pub trait CeremonySource: Send + Sync {
    /// Raw JSON payload for one ceremony
    async fn fetch_ceremony(&self, ceremony_key: &str) -> Result<serde_json::Value, SourceError>;
}

/// Catalog used when no base URL is configured
///
/// Every call fails as unavailable, so references still land as soft
/// placeholders queued for enrichment.
pub struct OfflineCatalog;

#[async_trait]
impl CatalogSource for OfflineCatalog {
    async fn list_page(&self, _query: &ListingQuery) -> Result<CatalogPage, SourceError> {
        Err(SourceError::Unavailable("catalog base_url not configured".to_string()))
    }

    async fn fetch_detail(
        &self,
        _kind: EntityKind,
        _id: &ExternalId,
    ) -> Result<CatalogItem, SourceError> {
        Err(SourceError::Unavailable("catalog base_url not configured".to_string()))
    }
}
