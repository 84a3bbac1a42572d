//! Import manifest persistence
//!
//! A manifest row plus its `manifest_entities` and `manifest_relations`
//! children. Status changes are compare-and-set on the current status so two
//! workers finishing the same phase cannot both apply a transition.

use marquee_common::{time, Error, Result};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::parse_uuid;
use crate::models::{
    BatchStatus, EntityKind, EntryStatus, ExternalId, ExternalIds, ImportManifest,
    ManifestEntity, ManifestRelation, ManifestSummary, RelationRole, RelationStatus,
};

/// Entity reference collected in Phase A
#[derive(Debug, Clone, PartialEq)]
pub struct NewManifestEntity {
    pub entry_key: String,
    pub kind: EntityKind,
    pub reference: ExternalId,
    pub display_name: String,
    pub external_ids: ExternalIds,
}

/// Relation collected in Phase A
#[derive(Debug, Clone, PartialEq)]
pub struct NewManifestRelation {
    pub relation_key: String,
    pub category: String,
    pub role: RelationRole,
    pub nominee_name: String,
    pub movie_entry: String,
    pub person_entry: Option<String>,
    pub won: bool,
    pub details: serde_json::Value,
}

/// What persisting a Phase A result changed
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub manifest_id: Uuid,
    /// Status before this batch was (re)collected; `None` for a new batch
    pub previous_status: Option<BatchStatus>,
    pub status: BatchStatus,
    pub new_entities: u64,
    pub new_relations: u64,
}

const MANIFEST_COLUMNS: &str =
    "manifest_id, batch_key, source, status, error, created_at, updated_at, completed_at";

const ENTITY_COLUMNS: &str = r#"
    manifest_id, entry_key, kind, namespace, external_id, display_name, external_ids,
    status, entity_guid, attempts, last_error, updated_at
"#;

const RELATION_COLUMNS: &str = r#"
    manifest_id, relation_key, category, role, nominee_name, movie_entry, person_entry,
    won, details, status, relation_guid, last_error, updated_at
"#;

/// Persist a collected batch in one transaction
///
/// A batch key seen before is merged: new entries and relations are added,
/// existing ones keep their status. Nothing outside the manifest tables is
/// written.
pub async fn persist_manifest(
    pool: &SqlitePool,
    batch_key: &str,
    source: &str,
    entities: &[NewManifestEntity],
    relations: &[NewManifestRelation],
) -> Result<PersistOutcome> {
    let now = time::now_db();
    let fresh_id = Uuid::new_v4();

    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        INSERT INTO import_manifests (manifest_id, batch_key, source, status, created_at, updated_at)
        VALUES (?, ?, ?, 'collecting', ?, ?)
        ON CONFLICT(batch_key) DO UPDATE SET updated_at = excluded.updated_at
        RETURNING manifest_id, status, created_at
        "#,
    )
    .bind(fresh_id.to_string())
    .bind(batch_key)
    .bind(source)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *tx)
    .await?;

    let manifest_id = parse_uuid(row.get("manifest_id"))?;
    let stored_status: BatchStatus = row.get::<String, _>("status").parse()?;
    let previous_status = if manifest_id == fresh_id {
        None
    } else {
        Some(stored_status)
    };

    let mut new_entities = 0;
    for entity in entities {
        new_entities += sqlx::query(
            r#"
            INSERT INTO manifest_entities (
                manifest_id, entry_key, kind, namespace, external_id, display_name,
                external_ids, status, attempts, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
            ON CONFLICT(manifest_id, entry_key) DO NOTHING
            "#,
        )
        .bind(manifest_id.to_string())
        .bind(&entity.entry_key)
        .bind(entity.kind.as_str())
        .bind(&entity.reference.namespace)
        .bind(&entity.reference.value)
        .bind(&entity.display_name)
        .bind(serde_json::to_string(&entity.external_ids)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    let mut new_relations = 0;
    for relation in relations {
        new_relations += sqlx::query(
            r#"
            INSERT INTO manifest_relations (
                manifest_id, relation_key, category, role, nominee_name, movie_entry,
                person_entry, won, details, status, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(manifest_id, relation_key) DO NOTHING
            "#,
        )
        .bind(manifest_id.to_string())
        .bind(&relation.relation_key)
        .bind(&relation.category)
        .bind(relation.role.as_str())
        .bind(&relation.nominee_name)
        .bind(&relation.movie_entry)
        .bind(&relation.person_entry)
        .bind(relation.won)
        .bind(serde_json::to_string(&relation.details)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    let has_new_work = new_entities > 0 || new_relations > 0;
    let status = match previous_status {
        None => BatchStatus::Resolving,
        Some(BatchStatus::Collecting) => BatchStatus::Resolving,
        Some(_) if has_new_work => BatchStatus::Resolving,
        Some(existing) => existing,
    };

    if Some(status) != previous_status {
        sqlx::query(
            r#"
            UPDATE import_manifests
            SET status = ?, error = NULL, completed_at = NULL, updated_at = ?
            WHERE manifest_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(manifest_id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(PersistOutcome {
        manifest_id,
        previous_status,
        status,
        new_entities,
        new_relations,
    })
}

/// Record a batch whose payload could not be collected
///
/// Creates (or marks) the manifest `failed` with the reason. A batch that
/// already completed is left untouched and `None` is returned.
pub async fn record_failed_batch(
    pool: &SqlitePool,
    batch_key: &str,
    source: &str,
    reason: &str,
) -> Result<Option<Uuid>> {
    let now = time::now_db();
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO import_manifests (manifest_id, batch_key, source, status, error, created_at, updated_at)
        VALUES (?, ?, ?, 'failed', ?, ?, ?)
        ON CONFLICT(batch_key) DO UPDATE SET
            status = 'failed', error = excluded.error, updated_at = excluded.updated_at
        WHERE import_manifests.status != 'complete'
        RETURNING manifest_id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(batch_key)
    .bind(source)
    .bind(reason)
    .bind(&now)
    .bind(&now)
    .fetch_optional(pool)
    .await?;

    row.map(|(id,)| parse_uuid(&id)).transpose()
}

pub async fn load_manifest(pool: &SqlitePool, manifest_id: Uuid) -> Result<Option<ImportManifest>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM import_manifests WHERE manifest_id = ?",
        MANIFEST_COLUMNS
    ))
    .bind(manifest_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|r| manifest_from_row(&r)).transpose()
}

/// Load a manifest or fail with `NotFound`
pub async fn require_manifest(pool: &SqlitePool, manifest_id: Uuid) -> Result<ImportManifest> {
    load_manifest(pool, manifest_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("manifest {}", manifest_id)))
}

pub async fn find_by_batch_key(pool: &SqlitePool, batch_key: &str) -> Result<Option<ImportManifest>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM import_manifests WHERE batch_key = ?",
        MANIFEST_COLUMNS
    ))
    .bind(batch_key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| manifest_from_row(&r)).transpose()
}

/// List manifests, newest first, optionally filtered by status
pub async fn list_manifests(
    pool: &SqlitePool,
    status: Option<BatchStatus>,
) -> Result<Vec<ImportManifest>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {} FROM import_manifests WHERE status = ? ORDER BY created_at DESC",
                MANIFEST_COLUMNS
            ))
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM import_manifests ORDER BY created_at DESC",
                MANIFEST_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(manifest_from_row).collect()
}

/// Every manifest not in `complete`
pub async fn list_incomplete(pool: &SqlitePool) -> Result<Vec<ImportManifest>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM import_manifests WHERE status != 'complete' ORDER BY created_at",
        MANIFEST_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(manifest_from_row).collect()
}

/// Non-terminal manifests untouched since `cutoff`
pub async fn list_idle_since(pool: &SqlitePool, cutoff: &str) -> Result<Vec<ImportManifest>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM import_manifests
        WHERE status IN ('collecting', 'resolving', 'materializing') AND updated_at < ?
        ORDER BY created_at
        "#,
        MANIFEST_COLUMNS
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.iter().map(manifest_from_row).collect()
}

/// Compare-and-set the batch status
///
/// `error` is stored for `failed`, cleared otherwise. Returns false if the
/// manifest was not in `expected`.
pub async fn set_status(
    pool: &SqlitePool,
    manifest_id: Uuid,
    expected: BatchStatus,
    new: BatchStatus,
    error: Option<&str>,
) -> Result<bool> {
    let now = time::now_db();
    let completed_at = (new == BatchStatus::Complete).then(|| now.clone());

    let result = sqlx::query(
        r#"
        UPDATE import_manifests
        SET status = ?, error = ?, completed_at = ?, updated_at = ?
        WHERE manifest_id = ? AND status = ?
        "#,
    )
    .bind(new.as_str())
    .bind(error)
    .bind(completed_at)
    .bind(&now)
    .bind(manifest_id.to_string())
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Bump `updated_at` so stall detection sees progress
pub async fn touch(pool: &SqlitePool, manifest_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE import_manifests SET updated_at = ? WHERE manifest_id = ?")
        .bind(time::now_db())
        .bind(manifest_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Entity entries of a manifest, optionally filtered by status
pub async fn load_entities(
    pool: &SqlitePool,
    manifest_id: Uuid,
    status: Option<EntryStatus>,
) -> Result<Vec<ManifestEntity>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {} FROM manifest_entities WHERE manifest_id = ? AND status = ? ORDER BY entry_key",
                ENTITY_COLUMNS
            ))
            .bind(manifest_id.to_string())
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM manifest_entities WHERE manifest_id = ? ORDER BY entry_key",
                ENTITY_COLUMNS
            ))
            .bind(manifest_id.to_string())
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(entity_from_row).collect()
}

pub async fn load_entity_entry(
    pool: &SqlitePool,
    manifest_id: Uuid,
    entry_key: &str,
) -> Result<Option<ManifestEntity>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM manifest_entities WHERE manifest_id = ? AND entry_key = ?",
        ENTITY_COLUMNS
    ))
    .bind(manifest_id.to_string())
    .bind(entry_key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| entity_from_row(&r)).transpose()
}

/// Count one resolution attempt on a pending entry
pub async fn record_entry_attempt(pool: &SqlitePool, manifest_id: Uuid, entry_key: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE manifest_entities SET attempts = attempts + 1, updated_at = ?
        WHERE manifest_id = ? AND entry_key = ? AND status = 'pending'
        "#,
    )
    .bind(time::now_db())
    .bind(manifest_id.to_string())
    .bind(entry_key)
    .execute(pool)
    .await?;
    Ok(())
}

/// `pending → resolved`; false if the entry was already terminal
pub async fn mark_entry_resolved(
    pool: &SqlitePool,
    manifest_id: Uuid,
    entry_key: &str,
    entity_guid: Uuid,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE manifest_entities
        SET status = 'resolved', entity_guid = ?, last_error = NULL, updated_at = ?
        WHERE manifest_id = ? AND entry_key = ? AND status = 'pending'
        "#,
    )
    .bind(entity_guid.to_string())
    .bind(time::now_db())
    .bind(manifest_id.to_string())
    .bind(entry_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// `pending → failed` with the reason; false if the entry was already terminal
pub async fn mark_entry_failed(
    pool: &SqlitePool,
    manifest_id: Uuid,
    entry_key: &str,
    reason: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE manifest_entities
        SET status = 'failed', last_error = ?, updated_at = ?
        WHERE manifest_id = ? AND entry_key = ? AND status = 'pending'
        "#,
    )
    .bind(reason)
    .bind(time::now_db())
    .bind(manifest_id.to_string())
    .bind(entry_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Put failed entries back to `pending` for another Phase B pass
pub async fn reset_failed_entries(pool: &SqlitePool, manifest_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE manifest_entities SET status = 'pending', updated_at = ?
        WHERE manifest_id = ? AND status = 'failed'
        "#,
    )
    .bind(time::now_db())
    .bind(manifest_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Relations of a manifest, optionally filtered by status
pub async fn load_relations(
    pool: &SqlitePool,
    manifest_id: Uuid,
    status: Option<RelationStatus>,
) -> Result<Vec<ManifestRelation>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {} FROM manifest_relations WHERE manifest_id = ? AND status = ? ORDER BY relation_key",
                RELATION_COLUMNS
            ))
            .bind(manifest_id.to_string())
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM manifest_relations WHERE manifest_id = ? ORDER BY relation_key",
                RELATION_COLUMNS
            ))
            .bind(manifest_id.to_string())
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(relation_from_row).collect()
}

/// Put failed relations back to `pending` for another Phase C pass
pub async fn reset_failed_relations(pool: &SqlitePool, manifest_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE manifest_relations SET status = 'pending', last_error = NULL, updated_at = ?
        WHERE manifest_id = ? AND status = 'failed'
        "#,
    )
    .bind(time::now_db())
    .bind(manifest_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Status counts for entries and relations
pub async fn summarize(pool: &SqlitePool, manifest_id: Uuid) -> Result<ManifestSummary> {
    let entity_counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM manifest_entities WHERE manifest_id = ? GROUP BY status",
    )
    .bind(manifest_id.to_string())
    .fetch_all(pool)
    .await?;

    let relation_counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM manifest_relations WHERE manifest_id = ? GROUP BY status",
    )
    .bind(manifest_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut summary = ManifestSummary::default();
    for (status, count) in entity_counts {
        let count = count as u64;
        match status.parse::<EntryStatus>()? {
            EntryStatus::Pending => summary.entities_pending = count,
            EntryStatus::Resolved => summary.entities_resolved = count,
            EntryStatus::Failed => summary.entities_failed = count,
        }
    }
    for (status, count) in relation_counts {
        let count = count as u64;
        match status.parse::<RelationStatus>()? {
            RelationStatus::Pending => summary.relations_pending = count,
            RelationStatus::Created => summary.relations_created = count,
            RelationStatus::Failed => summary.relations_failed = count,
        }
    }

    Ok(summary)
}

fn manifest_from_row(row: &SqliteRow) -> Result<ImportManifest> {
    let completed_at: Option<String> = row.get("completed_at");
    Ok(ImportManifest {
        manifest_id: parse_uuid(row.get("manifest_id"))?,
        batch_key: row.get("batch_key"),
        source: row.get("source"),
        status: row.get::<String, _>("status").parse()?,
        error: row.get("error"),
        created_at: time::from_db(row.get("created_at"))?,
        updated_at: time::from_db(row.get("updated_at"))?,
        completed_at: completed_at.as_deref().map(time::from_db).transpose()?,
    })
}

fn entity_from_row(row: &SqliteRow) -> Result<ManifestEntity> {
    let entity_guid: Option<String> = row.get("entity_guid");
    let external_ids: String = row.get("external_ids");
    let attempts: i64 = row.get("attempts");
    Ok(ManifestEntity {
        manifest_id: parse_uuid(row.get("manifest_id"))?,
        entry_key: row.get("entry_key"),
        kind: row.get::<String, _>("kind").parse()?,
        reference: ExternalId {
            namespace: row.get("namespace"),
            value: row.get("external_id"),
        },
        display_name: row.get("display_name"),
        external_ids: serde_json::from_str(&external_ids)?,
        status: row.get::<String, _>("status").parse()?,
        entity_guid: entity_guid.as_deref().map(parse_uuid).transpose()?,
        attempts: attempts.max(0) as u32,
        last_error: row.get("last_error"),
        updated_at: time::from_db(row.get("updated_at"))?,
    })
}

pub(crate) fn relation_from_row(row: &SqliteRow) -> Result<ManifestRelation> {
    let relation_guid: Option<String> = row.get("relation_guid");
    let details: String = row.get("details");
    Ok(ManifestRelation {
        manifest_id: parse_uuid(row.get("manifest_id"))?,
        relation_key: row.get("relation_key"),
        category: row.get("category"),
        role: row.get::<String, _>("role").parse()?,
        nominee_name: row.get("nominee_name"),
        movie_entry: row.get("movie_entry"),
        person_entry: row.get("person_entry"),
        won: row.get("won"),
        details: serde_json::from_str(&details)?,
        status: row.get::<String, _>("status").parse()?,
        relation_guid: relation_guid.as_deref().map(parse_uuid).transpose()?,
        last_error: row.get("last_error"),
        updated_at: time::from_db(row.get("updated_at"))?,
    })
}
