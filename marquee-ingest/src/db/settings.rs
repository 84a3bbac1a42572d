//! Settings database operations
//!
//! Key-value accessors for runtime overrides. A missing key and a NULL value
//! both read as "not set".

use marquee_common::{Error, Result};
use sqlx::SqlitePool;

/// Settings key for the catalog API key
pub const CATALOG_API_KEY: &str = "catalog_api_key";

/// Settings key for the lock retry budget
pub const MAX_LOCK_WAIT_MS: &str = "database_max_lock_wait_ms";

const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Get catalog API key from database
pub async fn get_catalog_api_key(db: &SqlitePool) -> Result<Option<String>> {
    get_setting::<String>(db, CATALOG_API_KEY)
        .await
        .map(|key| key.filter(|k| !k.trim().is_empty()))
}

/// Set catalog API key in database
pub async fn set_catalog_api_key(db: &SqlitePool, key: String) -> Result<()> {
    set_setting(db, CATALOG_API_KEY, key).await
}

/// Get the lock retry budget (default: 5000 ms)
pub async fn get_max_lock_wait_ms(db: &SqlitePool) -> Result<u64> {
    get_setting(db, MAX_LOCK_WAIT_MS)
        .await
        .map(|opt| opt.unwrap_or(DEFAULT_MAX_LOCK_WAIT_MS))
}

/// Generic setting getter
pub async fn get_setting<T>(db: &SqlitePool, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(db)
            .await?;

    match row.and_then(|(value,)| value) {
        Some(value) => {
            let parsed = value.trim().parse::<T>().map_err(|e| {
                Error::Config(format!("Parse setting '{}' failed: {}", key, e))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(db: &SqlitePool, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;

    #[tokio::test]
    async fn test_lock_wait_seeded_by_init() {
        let (_dir, pool) = temp_pool().await;
        assert_eq!(get_max_lock_wait_ms(&pool).await.unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_api_key_round_trip() {
        let (_dir, pool) = temp_pool().await;
        assert_eq!(get_catalog_api_key(&pool).await.unwrap(), None);

        set_catalog_api_key(&pool, "abc123".to_string()).await.unwrap();
        assert_eq!(
            get_catalog_api_key(&pool).await.unwrap(),
            Some("abc123".to_string())
        );
    }

    #[tokio::test]
    async fn test_blank_api_key_reads_as_unset() {
        let (_dir, pool) = temp_pool().await;
        set_catalog_api_key(&pool, "   ".to_string()).await.unwrap();
        assert_eq!(get_catalog_api_key(&pool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unparseable_value_is_config_error() {
        let (_dir, pool) = temp_pool().await;
        set_setting(&pool, "admission.full_min_votes", "lots").await.unwrap();

        let result = get_setting::<u32>(&pool, "admission.full_min_votes").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
