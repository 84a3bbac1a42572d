//! HTTP catalog client
//!
//! Listing: `GET {base}/{kind}s?page=N[&year=Y]` returning
//! `{ "items": [...], "has_more": bool }`.
//! Detail: `GET {base}/{kind}s/{namespace}/{id}`.
//!
//! Every request goes through the shared [`SourceRateLimiter`].

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::rate_limiter::SourceRateLimiter;
use super::sources::{CatalogSource, ListingQuery};
use crate::error::SourceError;
use crate::models::{CatalogItem, CatalogPage, EntityKind, ExternalId, ExternalIds};

pub(crate) const USER_AGENT: &str = concat!("marquee-ingest/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Item as the catalog serializes it; `kind` comes from the request
#[derive(Debug, Deserialize)]
struct WireItem {
    #[serde(default)]
    external_ids: ExternalIds,
    #[serde(alias = "name")]
    title: String,
    #[serde(default)]
    popularity: Option<f64>,
    #[serde(default)]
    vote_count: Option<u32>,
    #[serde(default, alias = "poster_path", alias = "profile_path")]
    image_path: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireListing {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    has_more: bool,
}

pub struct HttpCatalogClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<SourceRateLimiter>,
}

impl HttpCatalogClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        rate_limiter: Arc<SourceRateLimiter>,
    ) -> Result<Self, SourceError> {
        let http_client = build_http_client()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter,
        })
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<serde_json::Value, SourceError> {
        self.rate_limiter.acquire().await;

        tracing::debug!(url = %url, "Querying catalog");

        let mut request = self.http_client.get(url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body, what));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

/// reqwest client with the service user agent and a 30 s timeout
pub(crate) fn build_http_client() -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| SourceError::Network(e.to_string()))
}

/// Map a non-success status to a source error
pub(crate) fn status_error(status: u16, body: String, what: &str) -> SourceError {
    match status {
        404 => SourceError::NotFound(what.to_string()),
        429 | 503 => SourceError::RateLimited,
        _ => SourceError::Api { status, body },
    }
}

fn item_from_value(kind: EntityKind, raw: serde_json::Value) -> Result<CatalogItem, SourceError> {
    let wire: WireItem =
        serde_json::from_value(raw.clone()).map_err(|e| SourceError::Parse(e.to_string()))?;

    Ok(CatalogItem {
        kind,
        external_ids: wire.external_ids,
        title: wire.title,
        popularity: wire.popularity,
        vote_count: wire.vote_count,
        image_path: wire.image_path,
        release_date: wire.release_date,
        raw,
    })
}

#[async_trait]
impl CatalogSource for HttpCatalogClient {
    async fn list_page(&self, query: &ListingQuery) -> Result<CatalogPage, SourceError> {
        let url = format!("{}/{}s", self.base_url, query.kind);
        let mut params = vec![("page", query.page.to_string())];
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }

        let what = format!("{} listing page {}", query.kind, query.page);
        let body = self.get_json(&url, &params, &what).await?;
        let listing: WireListing =
            serde_json::from_value(body).map_err(|e| SourceError::Parse(e.to_string()))?;

        let mut items = Vec::with_capacity(listing.items.len());
        for raw in listing.items {
            match item_from_value(query.kind, raw) {
                Ok(item) => items.push(item),
                // One bad row should not sink the page
                Err(e) => tracing::warn!(page = query.page, error = %e, "Skipping unparseable listing item"),
            }
        }

        Ok(CatalogPage {
            items,
            has_more: listing.has_more,
        })
    }

    async fn fetch_detail(
        &self,
        kind: EntityKind,
        id: &ExternalId,
    ) -> Result<CatalogItem, SourceError> {
        let url = format!("{}/{}s/{}/{}", self.base_url, kind, id.namespace, id.value);
        let body = self.get_json(&url, &[], &format!("{} {}", kind, id)).await?;
        let mut item = item_from_value(kind, body)?;
        item.external_ids
            .entry(id.namespace.clone())
            .or_insert_with(|| id.value.clone());
        Ok(item)
    }
}
