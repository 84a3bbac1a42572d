//! Phase A: collect a ceremony into manifest entries and relations
//!
//! Pure transformation, nothing is written here. Every entity reference in
//! the payload becomes exactly one entry; references that share any external
//! id are merged first, so `{tmdb:98}` and `{tmdb:98, imdb:tt0172495}` never
//! race each other as two separate resolutions of the same movie.

use std::collections::{BTreeMap, HashMap};

use super::fuzzy_matcher::normalize_title;
use crate::db::manifests::{NewManifestEntity, NewManifestRelation};
use crate::models::manifest::{entry_key, relation_key, TITLE_NAMESPACE};
use crate::models::{
    catalog::clean_external_ids, primary_external_id, EntityRef, ExternalId, ExternalIds,
    NormalizedCeremony, RelationRole,
};

/// Everything Phase A produces for one batch
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedBatch {
    pub batch_key: String,
    pub entities: Vec<NewManifestEntity>,
    pub relations: Vec<NewManifestRelation>,
}

/// Union-find over references, keyed by every identifier they carry
#[derive(Default)]
struct ReferenceSet {
    refs: Vec<EntityRef>,
    parent: Vec<usize>,
    owners: HashMap<String, usize>,
}

impl ReferenceSet {
    fn add(&mut self, reference: &EntityRef) -> usize {
        let index = self.refs.len();
        self.refs.push(reference.clone());
        self.parent.push(index);

        for key in identity_keys(reference) {
            match self.owners.get(&key) {
                Some(&other) => self.union(index, other),
                None => {
                    self.owners.insert(key, index);
                }
            }
        }
        index
    }

    fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = index;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index stays root so the first mention names the entry
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}

fn identity_keys(reference: &EntityRef) -> Vec<String> {
    let ids = clean_external_ids(&reference.external_ids);
    if ids.is_empty() {
        return vec![format!(
            "{}:{}:{}",
            reference.kind,
            TITLE_NAMESPACE,
            normalize_title(&reference.display_name)
        )];
    }
    ids.iter()
        .map(|(namespace, value)| format!("{}:{}:{}", reference.kind, namespace, value))
        .collect()
}

/// Build the deduplicated manifest content for a normalized ceremony
pub fn collect(ceremony: &NormalizedCeremony, namespace_priority: &[String]) -> CollectedBatch {
    let batch_key = ceremony.batch_key();
    let mut set = ReferenceSet::default();

    // (category, nominee, movie ref, person refs)
    let mut staged = Vec::new();
    for category in &ceremony.categories {
        for nomination in &category.nominations {
            let movie = set.add(&nomination.movie);
            let persons: Vec<usize> = nomination.persons.iter().map(|p| set.add(p)).collect();
            staged.push((category, nomination, movie, persons));
        }
    }

    // Merge each cluster's identifiers, then pick its resolution key
    let mut clusters: BTreeMap<usize, (String, ExternalIds)> = BTreeMap::new();
    for index in 0..set.refs.len() {
        let root = set.find(index);
        let reference = &set.refs[index];
        let entry = clusters
            .entry(root)
            .or_insert_with(|| (reference.display_name.clone(), ExternalIds::new()));
        for (namespace, value) in clean_external_ids(&reference.external_ids) {
            entry.1.entry(namespace).or_insert(value);
        }
    }

    let mut keys: HashMap<usize, String> = HashMap::new();
    let mut entities: BTreeMap<String, NewManifestEntity> = BTreeMap::new();
    for (root, (display_name, external_ids)) in clusters {
        let kind = set.refs[root].kind;
        let reference = primary_external_id(&external_ids, namespace_priority)
            .unwrap_or_else(|| ExternalId::new(TITLE_NAMESPACE, normalize_title(&display_name)));
        let key = entry_key(kind, &reference);

        entities
            .entry(key.clone())
            .and_modify(|existing| {
                for (namespace, value) in &external_ids {
                    existing
                        .external_ids
                        .entry(namespace.clone())
                        .or_insert_with(|| value.clone());
                }
            })
            .or_insert_with(|| NewManifestEntity {
                entry_key: key.clone(),
                kind,
                reference,
                display_name: display_name.clone(),
                external_ids: external_ids.clone(),
            });
        keys.insert(root, key);
    }

    let mut key_of = |index: usize| -> String {
        let root = set.find(index);
        keys.get(&root).cloned().unwrap_or_default()
    };

    let mut relations: BTreeMap<String, NewManifestRelation> = BTreeMap::new();
    for (category, nomination, movie, persons) in staged {
        let movie_entry = key_of(movie);

        let person_entries: Vec<Option<String>> = if persons.is_empty() {
            vec![None]
        } else {
            persons.iter().map(|&p| Some(key_of(p))).collect()
        };

        for person_entry in person_entries {
            let role = if person_entry.is_some() {
                RelationRole::Person
            } else {
                RelationRole::Movie
            };
            let key = relation_key(
                &batch_key,
                &category.name,
                role,
                &movie_entry,
                person_entry.as_deref(),
            );

            relations
                .entry(key.clone())
                .and_modify(|existing| existing.won |= nomination.won)
                .or_insert_with(|| NewManifestRelation {
                    relation_key: key,
                    category: category.name.clone(),
                    role,
                    nominee_name: nomination.nominee_name.clone(),
                    movie_entry: movie_entry.clone(),
                    person_entry,
                    won: nomination.won,
                    details: nomination.details.clone(),
                });
        }
    }

    CollectedBatch {
        batch_key,
        entities: entities.into_values().collect(),
        relations: relations.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CeremonyPayload;
    use serde_json::json;

    fn priority() -> Vec<String> {
        vec!["tmdb".to_string(), "imdb".to_string()]
    }

    fn normalized(payload: serde_json::Value) -> NormalizedCeremony {
        CeremonyPayload::parse(&payload, "test").unwrap().normalize().unwrap()
    }

    #[test]
    fn test_shared_references_collected_once() {
        let ceremony = normalized(json!({
            "ceremony": "2001",
            "categories": [
                {
                    "category": "Best Actor",
                    "nominees": [{
                        "nominee_name": "Russell Crowe",
                        "movie_title": "Gladiator",
                        "external_ids_for_movie": {"tmdb": "98"},
                        "external_ids_for_persons": [{"tmdb": "934"}],
                        "won": true
                    }]
                },
                {
                    "category": "Best Picture",
                    "nominees": [{
                        "nominee_name": "Gladiator",
                        "external_ids_for_movie": {"tmdb": "98", "imdb": "tt0172495"},
                        "won": true
                    }]
                }
            ]
        }));

        let batch = collect(&ceremony, &priority());
        assert_eq!(batch.batch_key, "ceremony:2001");
        assert_eq!(batch.entities.len(), 2);

        let movie = batch.entities.iter().find(|e| e.entry_key == "movie:tmdb:98").unwrap();
        assert_eq!(movie.external_ids.get("imdb").map(String::as_str), Some("tt0172495"));

        assert_eq!(batch.relations.len(), 2);
        let actor = batch
            .relations
            .iter()
            .find(|r| r.role == RelationRole::Person)
            .unwrap();
        assert_eq!(actor.person_entry.as_deref(), Some("person:tmdb:934"));
        assert_eq!(actor.movie_entry, "movie:tmdb:98");
    }

    #[test]
    fn test_cross_reference_ids_merge_clusters() {
        // Second mention knows only imdb; the third links imdb and tmdb
        let ceremony = normalized(json!({
            "ceremony": "2001",
            "awards": {
                "Best Picture": [
                    {"nominee_name": "Traffic", "external_ids_for_movie": {"imdb": "tt0181865"}}
                ],
                "Best Director": [
                    {"nominee_name": "Steven Soderbergh", "movie_title": "Traffic",
                     "external_ids_for_movie": {"tmdb": "1900", "imdb": "tt0181865"},
                     "external_ids_for_person": {"tmdb": "1884"}}
                ]
            }
        }));

        let batch = collect(&ceremony, &priority());
        let movies: Vec<_> = batch
            .entities
            .iter()
            .filter(|e| e.kind == crate::models::EntityKind::Movie)
            .collect();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].entry_key, "movie:tmdb:1900");
        assert!(batch.relations.iter().all(|r| r.movie_entry == "movie:tmdb:1900"));
    }

    #[test]
    fn test_one_relation_per_person() {
        let ceremony = normalized(json!({
            "ceremony": "2001",
            "awards": {
                "Best Original Screenplay": [{
                    "nominee_name": "Joel Coen, Ethan Coen",
                    "movie_title": "O Brother, Where Art Thou?",
                    "external_ids_for_movie": {"tmdb": "134"},
                    "external_ids_for_persons": [{"tmdb": "1223"}, {"tmdb": "1224"}]
                }]
            }
        }));

        let batch = collect(&ceremony, &priority());
        assert_eq!(batch.entities.len(), 3);
        assert_eq!(batch.relations.len(), 2);
        assert!(batch.relations.iter().all(|r| r.role == RelationRole::Person));
    }

    #[test]
    fn test_persons_without_ids_keep_their_relations() {
        let ceremony = normalized(json!({
            "ceremony": "2001",
            "awards": {
                "Best Supporting Actress": [
                    {"nominee_name": "Kate Hudson", "movie_title": "Almost Famous",
                     "external_ids_for_movie": {"tmdb": "786"},
                     "external_ids_for_person": {}},
                    {"nominee_name": "Frances McDormand", "movie_title": "Almost Famous",
                     "external_ids_for_movie": {"tmdb": "786"},
                     "external_ids_for_person": {}}
                ]
            }
        }));

        let batch = collect(&ceremony, &priority());
        assert_eq!(batch.relations.len(), 2);
        assert!(batch.relations.iter().all(|r| r.role == RelationRole::Person));

        let mut persons: Vec<_> = batch
            .relations
            .iter()
            .filter_map(|r| r.person_entry.clone())
            .collect();
        persons.sort();
        assert_eq!(
            persons,
            vec![
                "person:title:frances mcdormand".to_string(),
                "person:title:kate hudson".to_string()
            ]
        );

        let kate = batch
            .entities
            .iter()
            .find(|e| e.entry_key == "person:title:kate hudson")
            .unwrap();
        assert_eq!(kate.display_name, "Kate Hudson");
        assert!(kate.external_ids.is_empty());
    }

    #[test]
    fn test_movie_without_ids_keyed_by_title() {
        let ceremony = normalized(json!({
            "ceremony": "1931",
            "awards": {
                "Best Picture": [{"nominee_name": "The Front Page"}]
            }
        }));

        let batch = collect(&ceremony, &priority());
        assert_eq!(batch.entities[0].entry_key, "movie:title:front page");
        assert_eq!(batch.entities[0].display_name, "The Front Page");
    }

    #[test]
    fn test_duplicate_nominations_collapse() {
        let nominee = json!({
            "nominee_name": "Chocolat",
            "external_ids_for_movie": {"tmdb": "392"}
        });
        let ceremony = normalized(json!({
            "ceremony": "2001",
            "categories": [{"category": "Best Picture", "nominees": [nominee.clone(), nominee]}]
        }));

        let batch = collect(&ceremony, &priority());
        assert_eq!(batch.relations.len(), 1);
    }
}
