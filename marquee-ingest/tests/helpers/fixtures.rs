//! Catalog items and ceremony payloads

use marquee_ingest::models::{CatalogItem, EntityKind, ExternalId, ExternalIds};
use serde_json::json;

fn ids(namespace: &str, value: &str) -> ExternalIds {
    let mut ids = ExternalIds::new();
    ids.insert(namespace.to_string(), value.to_string());
    ids
}

/// Item that clears every `full` threshold under default admission settings
pub fn full_item(kind: EntityKind, namespace: &str, value: &str, title: &str) -> CatalogItem {
    CatalogItem {
        kind,
        external_ids: ids(namespace, value),
        title: title.to_string(),
        popularity: Some(42.0),
        vote_count: Some(1200),
        image_path: Some(format!("/img/{}.jpg", value)),
        release_date: Some("1999-03-31".to_string()),
        raw: json!({ "id": value }),
    }
}

/// Item with an image and modest popularity but too few votes for `full`
pub fn soft_item(kind: EntityKind, namespace: &str, value: &str, title: &str) -> CatalogItem {
    CatalogItem {
        popularity: Some(2.5),
        vote_count: Some(3),
        release_date: None,
        ..full_item(kind, namespace, value, title)
    }
}

/// Item with no image, no date and no popularity
pub fn reject_item(kind: EntityKind, namespace: &str, value: &str, title: &str) -> CatalogItem {
    CatalogItem {
        popularity: Some(0.1),
        vote_count: None,
        image_path: None,
        release_date: None,
        ..full_item(kind, namespace, value, title)
    }
}

/// Person id of nominee `index` in category `category`
pub fn person_id(category: usize, index: usize) -> ExternalId {
    ExternalId::new("tmdb", format!("p{}-{}", category, index))
}

/// A ceremony with `categories` person categories of `nominees` each
///
/// Every nominee is a distinct person; movies repeat across categories, so
/// the same movie is referenced many times.
pub fn ceremony_payload(ceremony: i64, categories: usize, nominees: usize) -> serde_json::Value {
    let categories: Vec<serde_json::Value> = (0..categories)
        .map(|c| {
            let nominees: Vec<serde_json::Value> = (0..nominees)
                .map(|n| {
                    let movie = (c + n) % 7;
                    json!({
                        "nominee_name": format!("Person {}-{}", c, n),
                        "movie_title": format!("Movie {}", movie),
                        "external_ids_for_movie": { "tmdb": format!("m{}", movie) },
                        "external_ids_for_persons": { "tmdb": person_id(c, n).value },
                        "won": n == 0,
                    })
                })
                .collect();
            json!({ "category": format!("Category {}", c), "nominees": nominees })
        })
        .collect();

    json!({ "ceremony": ceremony, "categories": categories })
}
