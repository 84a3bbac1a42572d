//! Database initialization
//!
//! Opens (or creates) the SQLite database and runs idempotent schema creation.
//! Connection-level pragmas are set through `SqliteConnectOptions` so every
//! pooled connection gets them, not only the first one.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Default SQLite busy timeout before a locked write returns an error
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}", db_path.display());
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create every table used by the import engine (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;

    // Durable entities
    create_entities_table(pool).await?;
    create_entity_external_ids_table(pool).await?;
    create_nominations_table(pool).await?;

    // Audit / retry bookkeeping
    create_admission_decisions_table(pool).await?;
    create_enrichment_failures_table(pool).await?;

    // Import backbone
    create_import_cursors_table(pool).await?;
    create_import_manifests_table(pool).await?;
    create_manifest_entities_table(pool).await?;
    create_manifest_relations_table(pool).await?;

    create_jobs_table(pool).await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime overrides as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            guid TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('movie', 'person')),
            title TEXT NOT NULL,
            depth TEXT NOT NULL CHECK (depth IN ('full', 'soft')),
            raw_payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_kind_title ON entities(kind, title)")
        .execute(pool)
        .await?;

    Ok(())
}

/// One row per external identifier; the primary key is the uniqueness
/// guarantee behind "at most one entity per external id".
async fn create_entity_external_ids_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_external_ids (
            kind TEXT NOT NULL,
            namespace TEXT NOT NULL,
            external_id TEXT NOT NULL,
            entity_guid TEXT NOT NULL REFERENCES entities(guid) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (kind, namespace, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entity_external_ids_guid ON entity_external_ids(entity_guid)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_nominations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nominations (
            guid TEXT PRIMARY KEY,
            relation_key TEXT NOT NULL UNIQUE,
            batch_key TEXT NOT NULL,
            category TEXT NOT NULL,
            role TEXT NOT NULL,
            movie_guid TEXT NOT NULL REFERENCES entities(guid),
            person_guid TEXT REFERENCES entities(guid),
            won INTEGER NOT NULL DEFAULT 0,
            details TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nominations_batch ON nominations(batch_key)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_admission_decisions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS admission_decisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            namespace TEXT NOT NULL,
            external_id TEXT NOT NULL,
            tier TEXT NOT NULL CHECK (tier IN ('full', 'soft', 'reject')),
            signals TEXT NOT NULL,
            reasons TEXT NOT NULL DEFAULT '[]',
            stream TEXT,
            decided_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_admission_decisions_tier ON admission_decisions(tier, decided_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_enrichment_failures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_failures (
            kind TEXT NOT NULL,
            namespace TEXT NOT NULL,
            external_id TEXT NOT NULL,
            entity_guid TEXT NOT NULL REFERENCES entities(guid) ON DELETE CASCADE,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            resolved_at TEXT,
            PRIMARY KEY (kind, namespace, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_import_cursors_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_cursors (
            stream TEXT PRIMARY KEY,
            partition TEXT NOT NULL CHECK (partition IN ('page', 'year')),
            entity_kind TEXT NOT NULL CHECK (entity_kind IN ('movie', 'person')),
            start_position INTEGER NOT NULL,
            end_position INTEGER,
            current_position INTEGER NOT NULL,
            last_completed INTEGER,
            status TEXT NOT NULL CHECK (status IN ('in_progress', 'complete', 'stalled')),
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_import_manifests_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_manifests (
            manifest_id TEXT PRIMARY KEY,
            batch_key TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL,
            status TEXT NOT NULL CHECK (
                status IN ('collecting', 'resolving', 'materializing', 'complete', 'failed')
            ),
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_manifests_status ON import_manifests(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_manifest_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifest_entities (
            manifest_id TEXT NOT NULL REFERENCES import_manifests(manifest_id) ON DELETE CASCADE,
            entry_key TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('movie', 'person')),
            namespace TEXT NOT NULL,
            external_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            external_ids TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL CHECK (status IN ('pending', 'resolved', 'failed')),
            entity_guid TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (manifest_id, entry_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_manifest_relations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifest_relations (
            manifest_id TEXT NOT NULL REFERENCES import_manifests(manifest_id) ON DELETE CASCADE,
            relation_key TEXT NOT NULL,
            category TEXT NOT NULL,
            role TEXT NOT NULL,
            nominee_name TEXT NOT NULL,
            movie_entry TEXT NOT NULL,
            person_entry TEXT,
            won INTEGER NOT NULL DEFAULT 0,
            details TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL CHECK (status IN ('pending', 'created', 'failed')),
            relation_guid TEXT,
            last_error TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (manifest_id, relation_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            dedupe_key TEXT UNIQUE,
            payload TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'done', 'dead')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            run_after TEXT NOT NULL,
            leased_until TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, status, run_after)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seed default settings without overwriting operator changes
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(pool, "database_max_lock_wait_ms", "5000").await?;
    Ok(())
}

async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    Ok(())
}
