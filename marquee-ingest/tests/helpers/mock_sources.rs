//! Scripted catalog and ceremony sources
//!
//! Call counters plus injectable failures, so tests can assert exactly what
//! was fetched and make any fetch fail a set number of times.

use async_trait::async_trait;
use marquee_ingest::error::SourceError;
use marquee_ingest::models::{CatalogItem, CatalogPage, EntityKind, ExternalId};
use marquee_ingest::services::{CatalogSource, CeremonySource, ListingQuery};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type PageKey = (EntityKind, u32, Option<i32>);

/// A failure that fires `remaining` more times (`usize::MAX` = forever)
struct Scripted {
    error: SourceError,
    remaining: usize,
}

impl Scripted {
    fn fire(&mut self) -> Option<SourceError> {
        if self.remaining == 0 {
            return None;
        }
        if self.remaining != usize::MAX {
            self.remaining -= 1;
        }
        Some(self.error.clone())
    }
}

/// In-memory catalog
///
/// Detail fetches for ids without a scripted item return a synthesized item
/// that classifies `full`, unless `strict` is set, in which case they are
/// `NotFound`.
#[derive(Default)]
pub struct MockCatalog {
    strict: bool,
    details: Mutex<HashMap<String, CatalogItem>>,
    pages: Mutex<HashMap<PageKey, CatalogPage>>,
    detail_failures: Mutex<HashMap<String, Scripted>>,
    listing_failure: Mutex<Option<Scripted>>,
    detail_calls: Mutex<HashMap<String, usize>>,
    listing_calls: AtomicUsize,
}

fn detail_key(kind: EntityKind, id: &ExternalId) -> String {
    format!("{}:{}", kind, id)
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown ids are `NotFound` instead of synthesized
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Default::default()
        }
    }

    pub fn add_detail(&self, id: &ExternalId, item: CatalogItem) {
        self.details
            .lock()
            .unwrap()
            .insert(detail_key(item.kind, id), item);
    }

    pub fn add_page(&self, kind: EntityKind, page: u32, year: Option<i32>, listing: CatalogPage) {
        self.pages.lock().unwrap().insert((kind, page, year), listing);
    }

    /// Fail the next `times` detail fetches for one id
    pub fn fail_detail(&self, kind: EntityKind, id: &ExternalId, error: SourceError, times: usize) {
        self.detail_failures.lock().unwrap().insert(
            detail_key(kind, id),
            Scripted {
                error,
                remaining: times,
            },
        );
    }

    pub fn clear_detail_failure(&self, kind: EntityKind, id: &ExternalId) {
        self.detail_failures
            .lock()
            .unwrap()
            .remove(&detail_key(kind, id));
    }

    /// Fail the next `times` listing fetches
    pub fn fail_listing(&self, error: SourceError, times: usize) {
        *self.listing_failure.lock().unwrap() = Some(Scripted {
            error,
            remaining: times,
        });
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.lock().unwrap().values().sum()
    }

    pub fn detail_calls_for(&self, kind: EntityKind, id: &ExternalId) -> usize {
        self.detail_calls
            .lock()
            .unwrap()
            .get(&detail_key(kind, id))
            .copied()
            .unwrap_or(0)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for MockCatalog {
    async fn list_page(&self, query: &ListingQuery) -> Result<CatalogPage, SourceError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self
            .listing_failure
            .lock()
            .unwrap()
            .as_mut()
            .and_then(Scripted::fire)
        {
            return Err(error);
        }

        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(query.kind, query.page, query.year))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_detail(
        &self,
        kind: EntityKind,
        id: &ExternalId,
    ) -> Result<CatalogItem, SourceError> {
        let key = detail_key(kind, id);
        *self.detail_calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        if let Some(error) = self
            .detail_failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(Scripted::fire)
        {
            return Err(error);
        }

        if let Some(item) = self.details.lock().unwrap().get(&key) {
            return Ok(item.clone());
        }

        if self.strict {
            return Err(SourceError::NotFound(key));
        }

        // Empty title: the caller's reference name is kept on merge
        Ok(super::fixtures::full_item(kind, &id.namespace, &id.value, ""))
    }
}

/// Ceremony payloads by key
#[derive(Default)]
pub struct MockCeremonies {
    payloads: Mutex<HashMap<String, serde_json::Value>>,
    calls: AtomicUsize,
}

impl MockCeremonies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, payload: serde_json::Value) {
        self.payloads.lock().unwrap().insert(key.to_string(), payload);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CeremonySource for MockCeremonies {
    async fn fetch_ceremony(&self, ceremony_key: &str) -> Result<serde_json::Value, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .unwrap()
            .get(ceremony_key)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(ceremony_key.to_string()))
    }
}
