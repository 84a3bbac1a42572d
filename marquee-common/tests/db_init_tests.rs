//! Database initialization tests

use marquee_common::db::init_database;
use tempfile::TempDir;

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_database_created_with_full_schema() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("data").join("marquee.db");

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists(), "Database file was not created");

    let tables = table_names(&pool).await;
    for expected in [
        "admission_decisions",
        "enrichment_failures",
        "entities",
        "entity_external_ids",
        "import_cursors",
        "import_manifests",
        "jobs",
        "manifest_entities",
        "manifest_relations",
        "nominations",
        "settings",
    ] {
        assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_reopen_is_idempotent_and_keeps_settings() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("marquee.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query("UPDATE settings SET value = '900' WHERE key = 'database_max_lock_wait_ms'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.unwrap();
    let value: String =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = 'database_max_lock_wait_ms'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(value, "900");
}

#[tokio::test]
async fn test_external_id_primary_key_rejects_duplicates() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("marquee.db")).await.unwrap();

    sqlx::query(
        "INSERT INTO entities (guid, kind, title, depth, created_at, updated_at)
         VALUES ('e1', 'movie', 'Heat', 'soft', 'now', 'now')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let insert = "INSERT INTO entity_external_ids (kind, namespace, external_id, entity_guid, created_at)
                  VALUES ('movie', 'tmdb', '949', 'e1', 'now')";
    sqlx::query(insert).execute(&pool).await.unwrap();
    assert!(sqlx::query(insert).execute(&pool).await.is_err());
}
