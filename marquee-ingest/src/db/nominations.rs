//! Nomination (relation) persistence
//!
//! A nomination is written in the same transaction that re-reads the status
//! of every manifest entry it depends on, so it can never be created against
//! an entry that is still pending.

use chrono::{DateTime, Utc};
use marquee_common::{time, Error, Result};
use serde::Serialize;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{manifests::relation_from_row, parse_uuid};
use crate::models::{EntryStatus, ImportManifest, ManifestRelation, RelationRole, RelationStatus};

/// A materialized nomination
#[derive(Debug, Clone, Serialize)]
pub struct Nomination {
    pub guid: Uuid,
    pub relation_key: String,
    pub batch_key: String,
    pub category: String,
    pub role: RelationRole,
    pub movie_guid: Uuid,
    pub person_guid: Option<Uuid>,
    pub won: bool,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Result of one materialization attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RelationOutcome {
    /// This call wrote the nomination
    Created(Uuid),
    /// The nomination already existed (earlier run or another worker)
    AlreadyPresent(Uuid),
    /// Some dependencies are still pending
    Waiting(Vec<String>),
    /// A dependency failed; the relation is recorded as failed
    Failed(String),
}

struct Dependency {
    entry_key: String,
    status: EntryStatus,
    entity_guid: Option<Uuid>,
    last_error: Option<String>,
}

/// Create one relation if every entry it depends on is resolved
pub async fn materialize_relation(
    pool: &SqlitePool,
    manifest: &ImportManifest,
    relation_key: &str,
) -> Result<RelationOutcome> {
    let now = time::now_db();
    let mut tx = pool.begin().await?;

    // Write first: holds the write lock for the whole check-and-insert
    let touched = sqlx::query(
        r#"
        UPDATE manifest_relations SET updated_at = ?
        WHERE manifest_id = ? AND relation_key = ? AND status = 'pending'
        "#,
    )
    .bind(&now)
    .bind(manifest.manifest_id.to_string())
    .bind(relation_key)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let relation = load_relation(&mut tx, manifest.manifest_id, relation_key)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "relation {} in manifest {}",
                relation_key, manifest.manifest_id
            ))
        })?;

    if touched == 0 {
        tx.rollback().await?;
        return Ok(match relation.status {
            RelationStatus::Created => match relation.relation_guid {
                Some(guid) => RelationOutcome::AlreadyPresent(guid),
                None => {
                    return Err(Error::Internal(format!(
                        "relation {} created without guid",
                        relation_key
                    )))
                }
            },
            _ => RelationOutcome::Failed(
                relation
                    .last_error
                    .unwrap_or_else(|| "relation previously failed".to_string()),
            ),
        });
    }

    let mut waiting = Vec::new();
    let mut guids = Vec::new();
    for key in relation.dependencies() {
        let dependency = match load_dependency(&mut tx, manifest.manifest_id, key).await? {
            Some(dep) => dep,
            None => {
                let reason = format!("dependency {} missing from manifest", key);
                fail_relation(&mut tx, &relation, &reason, &now).await?;
                tx.commit().await?;
                return Ok(RelationOutcome::Failed(reason));
            }
        };

        match dependency.status {
            EntryStatus::Failed => {
                let reason = format!(
                    "dependency {} failed: {}",
                    dependency.entry_key,
                    dependency.last_error.as_deref().unwrap_or("unresolved")
                );
                fail_relation(&mut tx, &relation, &reason, &now).await?;
                tx.commit().await?;
                return Ok(RelationOutcome::Failed(reason));
            }
            EntryStatus::Pending => waiting.push(dependency.entry_key),
            EntryStatus::Resolved => match dependency.entity_guid {
                Some(guid) => guids.push(guid),
                None => {
                    return Err(Error::Internal(format!(
                        "entry {} resolved without entity",
                        dependency.entry_key
                    )))
                }
            },
        }
    }

    if !waiting.is_empty() {
        tx.rollback().await?;
        return Ok(RelationOutcome::Waiting(waiting));
    }

    let Some(&movie_guid) = guids.first() else {
        return Err(Error::Internal(format!("relation {} has no movie", relation_key)));
    };
    let person_guid = guids.get(1).copied();
    let guid = Uuid::new_v4();

    let inserted = sqlx::query(
        r#"
        INSERT INTO nominations (
            guid, relation_key, batch_key, category, role, movie_guid, person_guid,
            won, details, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(relation_key) DO NOTHING
        "#,
    )
    .bind(guid.to_string())
    .bind(&relation.relation_key)
    .bind(&manifest.batch_key)
    .bind(&relation.category)
    .bind(relation.role.as_str())
    .bind(movie_guid.to_string())
    .bind(person_guid.map(|g| g.to_string()))
    .bind(relation.won)
    .bind(serde_json::to_string(&relation.details)?)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    let stored: (String,) = sqlx::query_as("SELECT guid FROM nominations WHERE relation_key = ?")
        .bind(&relation.relation_key)
        .fetch_one(&mut *tx)
        .await?;
    let stored_guid = parse_uuid(&stored.0)?;

    sqlx::query(
        r#"
        UPDATE manifest_relations
        SET status = 'created', relation_guid = ?, last_error = NULL, updated_at = ?
        WHERE manifest_id = ? AND relation_key = ?
        "#,
    )
    .bind(stored_guid.to_string())
    .bind(&now)
    .bind(relation.manifest_id.to_string())
    .bind(&relation.relation_key)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(if inserted {
        RelationOutcome::Created(stored_guid)
    } else {
        RelationOutcome::AlreadyPresent(stored_guid)
    })
}

async fn load_relation(
    tx: &mut Transaction<'_, Sqlite>,
    manifest_id: Uuid,
    relation_key: &str,
) -> Result<Option<ManifestRelation>> {
    let row = sqlx::query(
        r#"
        SELECT manifest_id, relation_key, category, role, nominee_name, movie_entry, person_entry,
               won, details, status, relation_guid, last_error, updated_at
        FROM manifest_relations
        WHERE manifest_id = ? AND relation_key = ?
        "#,
    )
    .bind(manifest_id.to_string())
    .bind(relation_key)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(|r| relation_from_row(&r)).transpose()
}

async fn load_dependency(
    tx: &mut Transaction<'_, Sqlite>,
    manifest_id: Uuid,
    entry_key: &str,
) -> Result<Option<Dependency>> {
    let row = sqlx::query(
        r#"
        SELECT entry_key, status, entity_guid, last_error
        FROM manifest_entities
        WHERE manifest_id = ? AND entry_key = ?
        "#,
    )
    .bind(manifest_id.to_string())
    .bind(entry_key)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let entity_guid: Option<String> = row.get("entity_guid");
    Ok(Some(Dependency {
        entry_key: row.get("entry_key"),
        status: row.get::<String, _>("status").parse()?,
        entity_guid: entity_guid.as_deref().map(parse_uuid).transpose()?,
        last_error: row.get("last_error"),
    }))
}

async fn fail_relation(
    tx: &mut Transaction<'_, Sqlite>,
    relation: &ManifestRelation,
    reason: &str,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE manifest_relations SET status = 'failed', last_error = ?, updated_at = ?
        WHERE manifest_id = ? AND relation_key = ?
        "#,
    )
    .bind(reason)
    .bind(now)
    .bind(relation.manifest_id.to_string())
    .bind(&relation.relation_key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Nominations materialized for one batch
pub async fn list_for_batch(pool: &SqlitePool, batch_key: &str) -> Result<Vec<Nomination>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, relation_key, batch_key, category, role, movie_guid, person_guid,
               won, details, created_at
        FROM nominations
        WHERE batch_key = ?
        ORDER BY category, relation_key
        "#,
    )
    .bind(batch_key)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let person_guid: Option<String> = row.get("person_guid");
            let details: String = row.get("details");
            Ok(Nomination {
                guid: parse_uuid(row.get("guid"))?,
                relation_key: row.get("relation_key"),
                batch_key: row.get("batch_key"),
                category: row.get("category"),
                role: row.get::<String, _>("role").parse()?,
                movie_guid: parse_uuid(row.get("movie_guid"))?,
                person_guid: person_guid.as_deref().map(parse_uuid).transpose()?,
                won: row.get("won"),
                details: serde_json::from_str(&details)?,
                created_at: time::from_db(row.get("created_at"))?,
            })
        })
        .collect()
}

/// Count nominations for one batch, optionally for one role
pub async fn count_for_batch(
    pool: &SqlitePool,
    batch_key: &str,
    role: Option<RelationRole>,
) -> Result<i64> {
    let count: i64 = match role {
        Some(role) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM nominations WHERE batch_key = ? AND role = ?")
                .bind(batch_key)
                .bind(role.as_str())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM nominations WHERE batch_key = ?")
                .bind(batch_key)
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}
