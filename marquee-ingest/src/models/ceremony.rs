//! Ceremony payloads
//!
//! Sources deliver one of two shapes:
//!
//! ```json
//! { "ceremony": 2001, "categories": [ { "category": "Best Actor", "nominees": [ ... ] } ] }
//! { "ceremony": 2001, "awards": { "Best Actor": [ ... ] } }
//! ```
//!
//! Both are parsed into [`CeremonyPayload`] and normalized into one
//! [`NormalizedCeremony`] before anything else looks at them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::catalog::{clean_external_ids, EntityKind, ExternalIds};
use crate::error::IngestError;

/// Ceremony identifiers arrive as strings or bare years
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CeremonyId {
    Text(String),
    Number(i64),
}

impl CeremonyId {
    fn to_key(&self) -> String {
        match self {
            CeremonyId::Text(s) => s.trim().to_string(),
            CeremonyId::Number(n) => n.to_string(),
        }
    }
}

/// One person id map or a list of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PersonIds {
    One(ExternalIds),
    Many(Vec<ExternalIds>),
}

impl Default for PersonIds {
    fn default() -> Self {
        PersonIds::Many(Vec::new())
    }
}

impl PersonIds {
    fn into_vec(self) -> Vec<ExternalIds> {
        match self {
            PersonIds::One(ids) => vec![ids],
            PersonIds::Many(list) => list,
        }
    }
}

/// One nominee as delivered by the source
#[derive(Debug, Clone, Deserialize)]
pub struct RawNominee {
    pub nominee_name: String,
    #[serde(default)]
    pub movie_title: Option<String>,
    #[serde(default)]
    pub external_ids_for_movie: ExternalIds,
    #[serde(default, alias = "external_ids_for_person")]
    pub external_ids_for_persons: PersonIds,
    #[serde(default)]
    pub won: bool,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCategory {
    pub category: String,
    #[serde(default)]
    pub nominees: Vec<RawNominee>,
}

/// The two observed payload shapes
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CeremonyPayload {
    /// Flat list of categories
    CategoryList {
        ceremony: CeremonyId,
        categories: Vec<RawCategory>,
    },
    /// Category name → nominees
    AwardMap {
        ceremony: CeremonyId,
        awards: BTreeMap<String, Vec<RawNominee>>,
    },
}

/// Reference to an entity by identifiers, as found in a payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub display_name: String,
    pub external_ids: ExternalIds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedNomination {
    pub nominee_name: String,
    pub movie: EntityRef,
    /// Empty when the category credits the movie itself
    pub persons: Vec<EntityRef>,
    pub won: bool,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedCategory {
    pub name: String,
    pub nominations: Vec<NormalizedNomination>,
}

/// Canonical ceremony shape consumed by the manifest builder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedCeremony {
    pub ceremony_key: String,
    pub categories: Vec<NormalizedCategory>,
}

impl NormalizedCeremony {
    pub fn batch_key(&self) -> String {
        ceremony_batch_key(&self.ceremony_key)
    }

    pub fn nomination_count(&self) -> usize {
        self.categories.iter().map(|c| c.nominations.len()).sum()
    }
}

/// Batch key for a ceremony
pub fn ceremony_batch_key(ceremony_key: &str) -> String {
    format!("ceremony:{}", ceremony_key.trim())
}

impl CeremonyPayload {
    /// Parse a JSON payload; `fallback_key` names the batch in errors
    pub fn parse(value: &serde_json::Value, fallback_key: &str) -> Result<Self, IngestError> {
        serde_json::from_value(value.clone()).map_err(|e| IngestError::MalformedPayload {
            batch_key: ceremony_batch_key(fallback_key),
            reason: format!("unrecognized ceremony shape: {}", e),
        })
    }

    pub fn normalize(self) -> Result<NormalizedCeremony, IngestError> {
        let (ceremony, raw_categories): (CeremonyId, Vec<(String, Vec<RawNominee>)>) = match self
        {
            CeremonyPayload::CategoryList {
                ceremony,
                categories,
            } => (
                ceremony,
                categories
                    .into_iter()
                    .map(|c| (c.category, c.nominees))
                    .collect(),
            ),
            CeremonyPayload::AwardMap { ceremony, awards } => {
                (ceremony, awards.into_iter().collect())
            }
        };

        let ceremony_key = ceremony.to_key();
        let malformed = |reason: String| IngestError::MalformedPayload {
            batch_key: ceremony_batch_key(&ceremony_key),
            reason,
        };

        if ceremony_key.is_empty() {
            return Err(malformed("ceremony identifier is empty".to_string()));
        }
        if raw_categories.is_empty() {
            return Err(malformed("payload has no categories".to_string()));
        }

        let mut categories = Vec::with_capacity(raw_categories.len());
        for (name, nominees) in raw_categories {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(malformed("category with empty name".to_string()));
            }

            let mut nominations = Vec::with_capacity(nominees.len());
            for (index, nominee) in nominees.into_iter().enumerate() {
                let nominee_name = nominee.nominee_name.trim().to_string();
                if nominee_name.is_empty() {
                    return Err(malformed(format!(
                        "nominee {} in '{}' has no name",
                        index, name
                    )));
                }

                let movie_title = nominee
                    .movie_title
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&nominee_name)
                    .to_string();

                // An id-less person slot still names a person, keyed by title later
                let persons = nominee
                    .external_ids_for_persons
                    .into_vec()
                    .into_iter()
                    .map(|ids| clean_external_ids(&ids))
                    .map(|ids| EntityRef {
                        kind: EntityKind::Person,
                        display_name: nominee_name.clone(),
                        external_ids: ids,
                    })
                    .collect();

                nominations.push(NormalizedNomination {
                    movie: EntityRef {
                        kind: EntityKind::Movie,
                        display_name: movie_title,
                        external_ids: clean_external_ids(&nominee.external_ids_for_movie),
                    },
                    persons,
                    won: nominee.won,
                    details: nominee.details.unwrap_or(serde_json::Value::Null),
                    nominee_name,
                });
            }

            categories.push(NormalizedCategory { name, nominations });
        }

        Ok(NormalizedCeremony {
            ceremony_key,
            categories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_list_shape() {
        let payload = json!({
            "ceremony": "2001",
            "categories": [{
                "category": "Best Actor",
                "nominees": [{
                    "nominee_name": "Russell Crowe",
                    "movie_title": "Gladiator",
                    "external_ids_for_movie": {"tmdb": "98"},
                    "external_ids_for_persons": [{"tmdb": "934"}],
                    "won": true
                }]
            }]
        });

        let ceremony = CeremonyPayload::parse(&payload, "2001")
            .unwrap()
            .normalize()
            .unwrap();

        assert_eq!(ceremony.batch_key(), "ceremony:2001");
        let nomination = &ceremony.categories[0].nominations[0];
        assert_eq!(nomination.movie.display_name, "Gladiator");
        assert_eq!(nomination.persons.len(), 1);
        assert_eq!(nomination.persons[0].external_ids["tmdb"], "934");
        assert!(nomination.won);
    }

    #[test]
    fn test_award_map_shape_with_single_person_map() {
        let payload = json!({
            "ceremony": 2001,
            "awards": {
                "Best Picture": [{
                    "nominee_name": "Gladiator",
                    "external_ids_for_movie": {"TMDB": "98", "imdb": ""}
                }],
                "Best Director": [{
                    "nominee_name": "Steven Soderbergh",
                    "movie_title": "Traffic",
                    "external_ids_for_movie": {"tmdb": "1900"},
                    "external_ids_for_person": {"tmdb": "1884"}
                }]
            }
        });

        let ceremony = CeremonyPayload::parse(&payload, "fallback")
            .unwrap()
            .normalize()
            .unwrap();

        assert_eq!(ceremony.ceremony_key, "2001");
        assert_eq!(ceremony.nomination_count(), 2);

        let picture = ceremony
            .categories
            .iter()
            .find(|c| c.name == "Best Picture")
            .unwrap();
        let movie = &picture.nominations[0].movie;
        assert_eq!(movie.external_ids.len(), 1);
        assert_eq!(movie.external_ids["tmdb"], "98");
        assert!(picture.nominations[0].persons.is_empty());

        let director = ceremony
            .categories
            .iter()
            .find(|c| c.name == "Best Director")
            .unwrap();
        assert_eq!(director.nominations[0].persons.len(), 1);
    }

    #[test]
    fn test_person_slot_without_ids_is_kept() {
        let payload = json!({
            "ceremony": "1931",
            "awards": {
                "Best Actress": [{
                    "nominee_name": "Marie Dressler",
                    "movie_title": "Min and Bill",
                    "external_ids_for_movie": {"tmdb": "42822"},
                    "external_ids_for_person": {"imdb": "  "}
                }],
                "Best Picture": [{
                    "nominee_name": "Cimarron",
                    "external_ids_for_movie": {"tmdb": "42861"},
                    "external_ids_for_persons": []
                }]
            }
        });

        let ceremony = CeremonyPayload::parse(&payload, "1931")
            .unwrap()
            .normalize()
            .unwrap();

        let actress = ceremony
            .categories
            .iter()
            .find(|c| c.name == "Best Actress")
            .unwrap();
        let persons = &actress.nominations[0].persons;
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].display_name, "Marie Dressler");
        assert!(persons[0].external_ids.is_empty());

        let picture = ceremony
            .categories
            .iter()
            .find(|c| c.name == "Best Picture")
            .unwrap();
        assert!(picture.nominations[0].persons.is_empty());
    }

    #[test]
    fn test_unknown_shape_is_malformed() {
        let payload = json!({"ceremony": "2001", "results": []});
        let err = CeremonyPayload::parse(&payload, "2001").unwrap_err();
        match err {
            IngestError::MalformedPayload { batch_key, .. } => {
                assert_eq!(batch_key, "ceremony:2001")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_nameless_nominee_is_malformed() {
        let payload = json!({
            "ceremony": "2001",
            "awards": {"Best Picture": [{"nominee_name": "  "}]}
        });
        let result = CeremonyPayload::parse(&payload, "2001").unwrap().normalize();
        assert!(matches!(result, Err(IngestError::MalformedPayload { .. })));
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        let payload = json!({"ceremony": "2001", "categories": []});
        let result = CeremonyPayload::parse(&payload, "2001").unwrap().normalize();
        assert!(matches!(result, Err(IngestError::MalformedPayload { .. })));
    }
}
