//! Admission decision audit log

use marquee_common::{time, Result};
use sqlx::{Row, SqlitePool};

use crate::models::admission::{AdmissionDecision, AdmissionRecord, AdmissionTier};
use crate::models::{EntityKind, ExternalId};

/// Append one decision
pub async fn record_decision(
    pool: &SqlitePool,
    kind: EntityKind,
    external_id: &ExternalId,
    decision: &AdmissionDecision,
    stream: Option<&str>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO admission_decisions (kind, namespace, external_id, tier, signals, reasons, stream, decided_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(kind.as_str())
    .bind(&external_id.namespace)
    .bind(&external_id.value)
    .bind(decision.tier.as_str())
    .bind(serde_json::to_string(&decision.signals)?)
    .bind(serde_json::to_string(&decision.reasons)?)
    .bind(stream)
    .bind(time::now_db())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Most recent decisions first, optionally for one tier
pub async fn list_decisions(
    pool: &SqlitePool,
    tier: Option<AdmissionTier>,
    limit: u32,
) -> Result<Vec<AdmissionRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, kind, namespace, external_id, tier, signals, reasons, stream, decided_at
        FROM admission_decisions
        WHERE (?1 IS NULL OR tier = ?1)
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )
    .bind(tier.map(|t| t.as_str()))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let signals: String = row.get("signals");
            let reasons: String = row.get("reasons");
            Ok(AdmissionRecord {
                id: row.get("id"),
                kind: row.get::<String, _>("kind").parse()?,
                external_id: ExternalId {
                    namespace: row.get("namespace"),
                    value: row.get("external_id"),
                },
                tier: row.get::<String, _>("tier").parse()?,
                signals: serde_json::from_str(&signals)?,
                reasons: serde_json::from_str(&reasons)?,
                stream: row.get("stream"),
                decided_at: time::from_db(row.get("decided_at"))?,
            })
        })
        .collect()
}

/// Decision counts per tier
pub async fn count_by_tier(pool: &SqlitePool) -> Result<Vec<(AdmissionTier, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT tier, COUNT(*) FROM admission_decisions GROUP BY tier ORDER BY tier")
            .fetch_all(pool)
            .await?;

    rows.into_iter()
        .map(|(tier, count)| Ok((tier.parse()?, count)))
        .collect()
}
