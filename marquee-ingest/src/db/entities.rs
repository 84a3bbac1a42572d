//! Entity persistence
//!
//! `entity_external_ids` has primary key `(kind, namespace, external_id)`, so
//! claiming an identifier is a single `INSERT ... ON CONFLICT DO NOTHING`.
//! Whichever writer claims the resolution key owns the entity; every other
//! writer rolls back its provisional row and reads the winner. A new key
//! whose cross-reference id is already owned joins that owner instead.

use marquee_common::{time, Error, Result};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::parse_uuid;
use crate::models::{Depth, Entity, EntityKind, ExternalId, ExternalIds};

/// Entity to create or fetch
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub kind: EntityKind,
    /// Resolution key; must be one of `external_ids`
    pub primary: ExternalId,
    pub external_ids: ExternalIds,
    pub title: String,
    pub depth: Depth,
    pub raw_payload: serde_json::Value,
}

/// Result of an upsert
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub entity: Entity,
    /// This call inserted the row
    pub created: bool,
    /// This call moved an existing row from soft to full
    pub upgraded: bool,
}

/// Insert the entity if its resolution key is unclaimed, otherwise return the
/// existing one (upgrading `soft → full` when `new.depth` is full)
pub async fn upsert_entity(pool: &SqlitePool, new: &NewEntity) -> Result<UpsertOutcome> {
    let guid = Uuid::new_v4();
    let now = time::now_db();
    let raw_payload = serde_json::to_string(&new.raw_payload)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO entities (guid, kind, title, depth, raw_payload, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(guid.to_string())
    .bind(new.kind.as_str())
    .bind(&new.title)
    .bind(new.depth.as_str())
    .bind(&raw_payload)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    let claimed = claim_external_id(&mut tx, new.kind, &new.primary, guid, &now).await?;

    if claimed {
        if let Some(owner) = cross_reference_owner(&mut tx, new, guid).await? {
            // Same entity first seen under another id: hand the claim over
            sqlx::query("UPDATE entity_external_ids SET entity_guid = ? WHERE entity_guid = ?")
                .bind(owner.to_string())
                .bind(guid.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM entities WHERE guid = ?")
                .bind(guid.to_string())
                .execute(&mut *tx)
                .await?;
            attach_secondary_ids(&mut tx, new, owner, &now).await?;
            tx.commit().await?;

            debug!(
                kind = %new.kind,
                external_id = %new.primary,
                guid = %owner,
                "Attached external id to entity known by a cross-reference"
            );
            return existing_outcome(pool, new, owner, &raw_payload).await;
        }

        attach_secondary_ids(&mut tx, new, guid, &now).await?;
        tx.commit().await?;

        debug!(kind = %new.kind, external_id = %new.primary, guid = %guid, "Created entity");
        let entity = load_entity(pool, guid)
            .await?
            .ok_or_else(|| Error::Internal(format!("entity {} vanished after insert", guid)))?;
        return Ok(UpsertOutcome {
            entity,
            created: true,
            upgraded: false,
        });
    }

    // Lost the race (or the entity already existed): discard the provisional row
    tx.rollback().await?;

    let owner = owner_of(pool, new.kind, &new.primary)
        .await?
        .ok_or_else(|| {
            Error::Internal(format!(
                "external id {} claimed but owner not found",
                new.primary
            ))
        })?;

    attach_ids_to_existing(pool, new, owner).await?;
    existing_outcome(pool, new, owner, &raw_payload).await
}

/// Outcome for an upsert that landed on an entity that already existed
async fn existing_outcome(
    pool: &SqlitePool,
    new: &NewEntity,
    guid: Uuid,
    raw_payload: &str,
) -> Result<UpsertOutcome> {
    let upgraded = if new.depth == Depth::Full {
        upgrade_to_full(pool, new, raw_payload).await?
    } else {
        false
    };

    let entity = load_entity(pool, guid)
        .await?
        .ok_or_else(|| Error::Internal(format!("entity {} not found", guid)))?;

    debug!(
        kind = %new.kind,
        external_id = %new.primary,
        guid = %entity.guid,
        upgraded,
        "Resolved existing entity"
    );

    Ok(UpsertOutcome {
        entity,
        created: false,
        upgraded,
    })
}

/// Entity already owning one of `new`'s other identifiers
///
/// An owner that carries a different id in the primary's namespace is a
/// distinct entity and is not returned.
async fn cross_reference_owner(
    tx: &mut Transaction<'_, Sqlite>,
    new: &NewEntity,
    guid: Uuid,
) -> Result<Option<Uuid>> {
    for (namespace, value) in &new.external_ids {
        let id = ExternalId::new(namespace, value);
        if id == new.primary || id.value.is_empty() {
            continue;
        }

        let owner: Option<(String,)> = sqlx::query_as(
            "SELECT entity_guid FROM entity_external_ids WHERE kind = ? AND namespace = ? AND external_id = ?",
        )
        .bind(new.kind.as_str())
        .bind(&id.namespace)
        .bind(&id.value)
        .fetch_optional(&mut **tx)
        .await?;
        let Some((owner,)) = owner else {
            continue;
        };
        let owner = parse_uuid(&owner)?;
        if owner == guid {
            continue;
        }

        let rival: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entity_external_ids WHERE entity_guid = ? AND namespace = ?",
        )
        .bind(owner.to_string())
        .bind(&new.primary.namespace)
        .fetch_one(&mut **tx)
        .await?;
        if rival == 0 {
            return Ok(Some(owner));
        }
    }
    Ok(None)
}

async fn claim_external_id(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    id: &ExternalId,
    guid: Uuid,
    now: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO entity_external_ids (kind, namespace, external_id, entity_guid, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(kind, namespace, external_id) DO NOTHING
        "#,
    )
    .bind(kind.as_str())
    .bind(&id.namespace)
    .bind(&id.value)
    .bind(guid.to_string())
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn attach_secondary_ids(
    tx: &mut Transaction<'_, Sqlite>,
    new: &NewEntity,
    guid: Uuid,
    now: &str,
) -> Result<()> {
    for (namespace, value) in &new.external_ids {
        let id = ExternalId::new(namespace, value);
        if id == new.primary || id.value.is_empty() {
            continue;
        }
        if !claim_external_id(tx, new.kind, &id, guid, now).await? {
            warn!(
                kind = %new.kind,
                external_id = %id,
                guid = %guid,
                "Cross-reference id already owned by another entity, not attached"
            );
        }
    }
    Ok(())
}

/// Attach identifiers learned later to an existing entity
///
/// Each insert is independent; an id owned by a different entity is logged
/// and left alone.
async fn attach_ids_to_existing(pool: &SqlitePool, new: &NewEntity, guid: Uuid) -> Result<()> {
    let now = time::now_db();

    for (namespace, value) in &new.external_ids {
        let id = ExternalId::new(namespace, value);
        if id == new.primary || id.value.is_empty() {
            continue;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO entity_external_ids (kind, namespace, external_id, entity_guid, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(kind, namespace, external_id) DO NOTHING
            "#,
        )
        .bind(new.kind.as_str())
        .bind(&id.namespace)
        .bind(&id.value)
        .bind(guid.to_string())
        .bind(&now)
        .execute(pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            if let Some(owner) = owner_of(pool, new.kind, &id).await? {
                if owner != guid {
                    warn!(
                        kind = %new.kind,
                        external_id = %id,
                        owner = %owner,
                        guid = %guid,
                        "Cross-reference id already owned by another entity, not attached"
                    );
                }
            }
        }
    }

    Ok(())
}

/// Conditional `soft → full` upgrade; never touches a full row
async fn upgrade_to_full(pool: &SqlitePool, new: &NewEntity, raw_payload: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE entities
        SET depth = 'full', title = ?, raw_payload = ?, updated_at = ?
        WHERE depth = 'soft'
          AND guid = (
              SELECT entity_guid FROM entity_external_ids
              WHERE kind = ? AND namespace = ? AND external_id = ?
          )
        "#,
    )
    .bind(&new.title)
    .bind(raw_payload)
    .bind(time::now_db())
    .bind(new.kind.as_str())
    .bind(&new.primary.namespace)
    .bind(&new.primary.value)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn owner_of(pool: &SqlitePool, kind: EntityKind, id: &ExternalId) -> Result<Option<Uuid>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT entity_guid FROM entity_external_ids WHERE kind = ? AND namespace = ? AND external_id = ?",
    )
    .bind(kind.as_str())
    .bind(&id.namespace)
    .bind(&id.value)
    .fetch_optional(pool)
    .await?;

    row.map(|(guid,)| parse_uuid(&guid)).transpose()
}

/// Load entity by internal id
pub async fn load_entity(pool: &SqlitePool, guid: Uuid) -> Result<Option<Entity>> {
    let row = sqlx::query(
        r#"
        SELECT guid, kind, title, depth, raw_payload, created_at, updated_at
        FROM entities
        WHERE guid = ?
        "#,
    )
    .bind(guid.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let external_ids = load_external_ids(pool, guid).await?;
    let raw_payload: String = row.get("raw_payload");

    Ok(Some(Entity {
        guid: parse_uuid(row.get("guid"))?,
        kind: row.get::<String, _>("kind").parse()?,
        title: row.get("title"),
        depth: row.get::<String, _>("depth").parse()?,
        external_ids,
        raw_payload: serde_json::from_str(&raw_payload)?,
        created_at: time::from_db(row.get("created_at"))?,
        updated_at: time::from_db(row.get("updated_at"))?,
    }))
}

/// Load entity by one of its external identifiers
pub async fn find_by_external_id(
    pool: &SqlitePool,
    kind: EntityKind,
    id: &ExternalId,
) -> Result<Option<Entity>> {
    match owner_of(pool, kind, id).await? {
        Some(guid) => load_entity(pool, guid).await,
        None => Ok(None),
    }
}

/// All identifiers attached to an entity
pub async fn load_external_ids(pool: &SqlitePool, guid: Uuid) -> Result<ExternalIds> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT namespace, external_id FROM entity_external_ids WHERE entity_guid = ? ORDER BY namespace",
    )
    .bind(guid.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Titles of entities of `kind` whose normalized title starts with `initial`
///
/// Candidate set for the fuzzy title matcher.
pub async fn title_candidates(
    pool: &SqlitePool,
    kind: EntityKind,
    initial: char,
) -> Result<Vec<(Uuid, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT guid, title FROM entities WHERE kind = ? AND substr(lower(trim(title)), 1, 1) = ?",
    )
    .bind(kind.as_str())
    .bind(initial.to_lowercase().to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(guid, title)| Ok((parse_uuid(&guid)?, title)))
        .collect()
}

/// Count entities of one kind
pub async fn count_entities(pool: &SqlitePool, kind: EntityKind) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE kind = ?")
        .bind(kind.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
