//! Enrichment failures
//!
//! One row per external id whose full detail fetch failed and was stored as a
//! soft placeholder. Rows stay until a later fetch succeeds.

use chrono::{DateTime, Utc};
use marquee_common::{time, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::parse_uuid;
use crate::models::{EntityKind, ExternalId};

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentFailure {
    pub kind: EntityKind,
    pub external_id: ExternalId,
    pub entity_guid: Uuid,
    pub reason: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record (or re-record) a failed detail fetch
pub async fn record_failure(
    pool: &SqlitePool,
    kind: EntityKind,
    external_id: &ExternalId,
    entity_guid: Uuid,
    reason: &str,
) -> Result<()> {
    let now = time::now_db();
    sqlx::query(
        r#"
        INSERT INTO enrichment_failures (
            kind, namespace, external_id, entity_guid, reason, attempts, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        ON CONFLICT(kind, namespace, external_id) DO UPDATE SET
            reason = excluded.reason,
            attempts = enrichment_failures.attempts + 1,
            updated_at = excluded.updated_at,
            resolved_at = NULL
        "#,
    )
    .bind(kind.as_str())
    .bind(&external_id.namespace)
    .bind(&external_id.value)
    .bind(entity_guid.to_string())
    .bind(reason)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Oldest unresolved failures first
pub async fn list_unresolved(pool: &SqlitePool, limit: u32) -> Result<Vec<EnrichmentFailure>> {
    let rows = sqlx::query(
        r#"
        SELECT kind, namespace, external_id, entity_guid, reason, attempts, created_at, updated_at
        FROM enrichment_failures
        WHERE resolved_at IS NULL
        ORDER BY updated_at
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let attempts: i64 = row.get("attempts");
            Ok(EnrichmentFailure {
                kind: row.get::<String, _>("kind").parse()?,
                external_id: ExternalId {
                    namespace: row.get("namespace"),
                    value: row.get("external_id"),
                },
                entity_guid: parse_uuid(row.get("entity_guid"))?,
                reason: row.get("reason"),
                attempts: attempts.max(0) as u32,
                created_at: time::from_db(row.get("created_at"))?,
                updated_at: time::from_db(row.get("updated_at"))?,
            })
        })
        .collect()
}

pub async fn mark_resolved(pool: &SqlitePool, kind: EntityKind, external_id: &ExternalId) -> Result<()> {
    let now = time::now_db();
    sqlx::query(
        r#"
        UPDATE enrichment_failures SET resolved_at = ?, updated_at = ?
        WHERE kind = ? AND namespace = ? AND external_id = ?
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(kind.as_str())
    .bind(&external_id.namespace)
    .bind(&external_id.value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_unresolved(pool: &SqlitePool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_failures WHERE resolved_at IS NULL")
            .fetch_one(pool)
            .await?;
    Ok(count)
}
