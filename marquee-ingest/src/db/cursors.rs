//! Import cursor store
//!
//! Every position change is a compare-and-set on `current_position`, so
//! concurrent or repeated scheduler runs for the same stream cannot move a
//! cursor backwards or skip a position: exactly one caller wins each step.

use marquee_common::{time, Result};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::warn;

use crate::models::{CursorStatus, EntityKind, ImportCursor, Partition};

/// Definition of a discovery stream
#[derive(Debug, Clone)]
pub struct NewCursor {
    pub stream: String,
    pub partition: Partition,
    pub entity_kind: EntityKind,
    pub start_position: i64,
    pub end_position: Option<i64>,
}

const CURSOR_COLUMNS: &str = r#"
    stream, partition, entity_kind, start_position, end_position, current_position,
    last_completed, status, last_error, created_at, updated_at, completed_at
"#;

/// Create the cursor if the stream is new; return the stored cursor either way
pub async fn ensure_cursor(pool: &SqlitePool, new: &NewCursor) -> Result<ImportCursor> {
    let now = time::now_db();

    sqlx::query(
        r#"
        INSERT INTO import_cursors (
            stream, partition, entity_kind, start_position, end_position, current_position,
            last_completed, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, NULL, 'in_progress', ?, ?)
        ON CONFLICT(stream) DO NOTHING
        "#,
    )
    .bind(&new.stream)
    .bind(new.partition.as_str())
    .bind(new.entity_kind.as_str())
    .bind(new.start_position)
    .bind(new.end_position)
    .bind(new.start_position)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    let cursor = load_cursor(pool, &new.stream).await?.ok_or_else(|| {
        marquee_common::Error::Internal(format!("cursor {} missing after insert", new.stream))
    })?;

    if cursor.partition != new.partition || cursor.entity_kind != new.entity_kind {
        warn!(
            stream = %new.stream,
            stored_partition = cursor.partition.as_str(),
            stored_kind = %cursor.entity_kind,
            "Stream already exists with a different definition, keeping stored cursor"
        );
    }

    Ok(cursor)
}

pub async fn load_cursor(pool: &SqlitePool, stream: &str) -> Result<Option<ImportCursor>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM import_cursors WHERE stream = ?",
        CURSOR_COLUMNS
    ))
    .bind(stream)
    .fetch_optional(pool)
    .await?;

    row.map(|r| cursor_from_row(&r)).transpose()
}

/// List cursors, optionally filtered by status
pub async fn list_cursors(
    pool: &SqlitePool,
    status: Option<CursorStatus>,
) -> Result<Vec<ImportCursor>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {} FROM import_cursors WHERE status = ? ORDER BY stream",
                CURSOR_COLUMNS
            ))
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM import_cursors ORDER BY stream",
                CURSOR_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(cursor_from_row).collect()
}

/// Cursors that are not complete (in progress or stalled)
pub async fn list_incomplete(pool: &SqlitePool) -> Result<Vec<ImportCursor>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM import_cursors WHERE status != 'complete' ORDER BY stream",
        CURSOR_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(cursor_from_row).collect()
}

/// Record `position` as completed and move to `position + 1`
///
/// Returns false when another invocation already moved the cursor or the
/// stream is no longer in progress.
pub async fn advance(pool: &SqlitePool, stream: &str, position: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_cursors
        SET last_completed = ?, current_position = ? + 1, last_error = NULL, updated_at = ?
        WHERE stream = ? AND current_position = ? AND status = 'in_progress'
        "#,
    )
    .bind(position)
    .bind(position)
    .bind(time::now_db())
    .bind(stream)
    .bind(position)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark the stream complete while it still sits at `position`
pub async fn mark_complete(pool: &SqlitePool, stream: &str, position: i64) -> Result<bool> {
    let now = time::now_db();
    let result = sqlx::query(
        r#"
        UPDATE import_cursors
        SET status = 'complete', last_error = NULL, updated_at = ?, completed_at = ?
        WHERE stream = ? AND current_position = ? AND status = 'in_progress'
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(stream)
    .bind(position)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Remember the latest fetch failure without moving the cursor
pub async fn record_error(pool: &SqlitePool, stream: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE import_cursors SET last_error = ?, updated_at = ? WHERE stream = ?")
        .bind(error)
        .bind(time::now_db())
        .bind(stream)
        .execute(pool)
        .await?;
    Ok(())
}

/// Park an in-progress stream until an operator resumes it
pub async fn mark_stalled(pool: &SqlitePool, stream: &str, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_cursors
        SET status = 'stalled', last_error = ?, updated_at = ?
        WHERE stream = ? AND status = 'in_progress'
        "#,
    )
    .bind(reason)
    .bind(time::now_db())
    .bind(stream)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Put a stalled stream back to work at `last_completed + 1`
///
/// Returns false for a cursor that is not stalled.
pub async fn reactivate(pool: &SqlitePool, stream: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_cursors
        SET status = 'in_progress',
            current_position = COALESCE(last_completed + 1, start_position),
            last_error = NULL,
            updated_at = ?
        WHERE stream = ? AND status = 'stalled'
        "#,
    )
    .bind(time::now_db())
    .bind(stream)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// In-progress cursors untouched since `cutoff`
pub async fn list_idle_since(pool: &SqlitePool, cutoff: &str) -> Result<Vec<ImportCursor>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM import_cursors WHERE status = 'in_progress' AND updated_at < ? ORDER BY stream",
        CURSOR_COLUMNS
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.iter().map(cursor_from_row).collect()
}

fn cursor_from_row(row: &SqliteRow) -> Result<ImportCursor> {
    let completed_at: Option<String> = row.get("completed_at");
    Ok(ImportCursor {
        stream: row.get("stream"),
        partition: row.get::<String, _>("partition").parse()?,
        entity_kind: row.get::<String, _>("entity_kind").parse()?,
        start_position: row.get("start_position"),
        end_position: row.get("end_position"),
        current_position: row.get("current_position"),
        last_completed: row.get("last_completed"),
        status: row.get::<String, _>("status").parse()?,
        last_error: row.get("last_error"),
        created_at: time::from_db(row.get("created_at"))?,
        updated_at: time::from_db(row.get("updated_at"))?,
        completed_at: completed_at.as_deref().map(time::from_db).transpose()?,
    })
}
