//! Catalog items and durable entities

use chrono::{DateTime, Utc};
use marquee_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The two entity kinds the engine materializes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Movie,
    Person,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Movie => "movie",
            EntityKind::Person => "person",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "movie" => Ok(EntityKind::Movie),
            "person" => Ok(EntityKind::Person),
            other => Err(Error::InvalidInput(format!("Unknown entity kind: {}", other))),
        }
    }
}

/// How much of an entity has been materialized
///
/// Ordered so that `Soft < Full`; depth only ever moves upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Soft,
    Full,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Soft => "soft",
            Depth::Full => "full",
        }
    }
}

impl FromStr for Depth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "soft" => Ok(Depth::Soft),
            "full" => Ok(Depth::Full),
            other => Err(Error::InvalidInput(format!("Unknown depth: {}", other))),
        }
    }
}

/// Namespace → identifier, e.g. `{"tmdb": "603", "imdb": "tt0133093"}`
pub type ExternalIds = BTreeMap<String, String>;

/// One identifier inside one namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    pub namespace: String,
    pub value: String,
}

impl ExternalId {
    pub fn new(namespace: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        Self {
            namespace: namespace.as_ref().trim().to_ascii_lowercase(),
            value: value.as_ref().trim().to_string(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

/// Normalize namespaces to lowercase and drop blank identifiers
pub fn clean_external_ids(ids: &ExternalIds) -> ExternalIds {
    ids.iter()
        .map(|(ns, value)| ExternalId::new(ns, value))
        .filter(|id| !id.namespace.is_empty() && !id.value.is_empty())
        .map(|id| (id.namespace, id.value))
        .collect()
}

/// Pick the resolution key for a set of identifiers
///
/// The first namespace from `priority` that is present wins; otherwise the
/// alphabetically first namespace is used. Returns `None` for an empty set.
pub fn primary_external_id(ids: &ExternalIds, priority: &[String]) -> Option<ExternalId> {
    let ids = clean_external_ids(ids);

    for namespace in priority {
        let namespace = namespace.to_ascii_lowercase();
        if let Some(value) = ids.get(&namespace) {
            return Some(ExternalId::new(&namespace, value));
        }
    }

    ids.iter()
        .next()
        .map(|(namespace, value)| ExternalId::new(namespace, value))
}

/// Raw attributes from the external source for one candidate entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub kind: EntityKind,
    #[serde(default)]
    pub external_ids: ExternalIds,
    /// Movie title or person name
    pub title: String,
    #[serde(default)]
    pub popularity: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<u32>,
    /// Poster or profile image reference
    #[serde(default)]
    pub image_path: Option<String>,
    /// Release or availability date as reported by the source
    #[serde(default)]
    pub release_date: Option<String>,
    /// Untouched source payload kept for reprocessing
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl CatalogItem {
    /// Minimal item for a reference that has nothing but ids and a name
    pub fn placeholder(kind: EntityKind, title: &str, external_ids: ExternalIds) -> Self {
        Self {
            kind,
            external_ids,
            title: title.to_string(),
            popularity: None,
            vote_count: None,
            image_path: None,
            release_date: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Overlay a detail fetch on top of a listing item
    ///
    /// Detail values win; identifiers are merged.
    pub fn merged_with(mut self, detail: CatalogItem) -> CatalogItem {
        let mut external_ids = std::mem::take(&mut self.external_ids);
        external_ids.extend(detail.external_ids);

        CatalogItem {
            kind: self.kind,
            external_ids,
            title: if detail.title.trim().is_empty() {
                self.title
            } else {
                detail.title
            },
            popularity: detail.popularity.or(self.popularity),
            vote_count: detail.vote_count.or(self.vote_count),
            image_path: detail.image_path.or(self.image_path),
            release_date: detail.release_date.or(self.release_date),
            raw: if detail.raw.is_null() { self.raw } else { detail.raw },
        }
    }
}

/// One listing page from a catalog source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    #[serde(default)]
    pub has_more: bool,
}

/// A durable local entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub guid: Uuid,
    pub kind: EntityKind,
    pub title: String,
    pub depth: Depth,
    pub external_ids: ExternalIds,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[(&str, &str)]) -> ExternalIds {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_primary_id_follows_priority() {
        let priority = vec!["tmdb".to_string(), "imdb".to_string()];
        let both = ids(&[("imdb", "tt0133093"), ("tmdb", "603")]);
        assert_eq!(
            primary_external_id(&both, &priority),
            Some(ExternalId::new("tmdb", "603"))
        );

        let imdb_only = ids(&[("IMDB", " tt0133093 ")]);
        assert_eq!(
            primary_external_id(&imdb_only, &priority),
            Some(ExternalId::new("imdb", "tt0133093"))
        );
    }

    #[test]
    fn test_primary_id_ignores_blank_values() {
        let priority = vec!["tmdb".to_string()];
        let blank = ids(&[("tmdb", "  "), ("wikidata", "Q83495")]);
        assert_eq!(
            primary_external_id(&blank, &priority),
            Some(ExternalId::new("wikidata", "Q83495"))
        );
        assert_eq!(primary_external_id(&ExternalIds::new(), &priority), None);
    }

    #[test]
    fn test_depth_orders_soft_below_full() {
        assert!(Depth::Soft < Depth::Full);
        assert_eq!(Depth::Soft.max(Depth::Full), Depth::Full);
    }

    #[test]
    fn test_merge_prefers_detail_values() {
        let listing = CatalogItem {
            popularity: Some(3.0),
            image_path: Some("/a.jpg".into()),
            ..CatalogItem::placeholder(EntityKind::Movie, "The Matrix", ids(&[("tmdb", "603")]))
        };
        let detail = CatalogItem {
            popularity: Some(42.0),
            vote_count: Some(9000),
            ..CatalogItem::placeholder(EntityKind::Movie, "", ids(&[("imdb", "tt0133093")]))
        };

        let merged = listing.merged_with(detail);
        assert_eq!(merged.title, "The Matrix");
        assert_eq!(merged.popularity, Some(42.0));
        assert_eq!(merged.vote_count, Some(9000));
        assert_eq!(merged.image_path.as_deref(), Some("/a.jpg"));
        assert_eq!(merged.external_ids.len(), 2);
    }
}
