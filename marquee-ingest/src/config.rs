//! Configuration resolution for marquee-ingest
//!
//! Each tunable resolves Database → ENV → TOML → compiled default. The
//! database tier lives in the `settings` table under `section.key` names, so
//! an operator can change thresholds without touching files.

use marquee_common::config::{SourceConfig, TomlConfig};
use marquee_common::{Error, Result};
use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::db::settings;
use crate::models::{AdmissionThresholds, ImportParameters};

/// Environment variable for the catalog API key
pub const CATALOG_API_KEY_ENV: &str = "MARQUEE_CATALOG_API_KEY";

/// Fully resolved engine configuration
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub admission: AdmissionThresholds,
    pub import: ImportParameters,
    pub catalog: SourceConfig,
    pub ceremony: SourceConfig,
    pub max_lock_wait_ms: u64,
}

/// Resolve the engine configuration from all tiers
pub async fn resolve_ingest_config(db: &SqlitePool, toml_config: &TomlConfig) -> Result<IngestConfig> {
    let mut admission: AdmissionThresholds = TomlConfig::section(&toml_config.admission)?;
    let mut import: ImportParameters = TomlConfig::section(&toml_config.import)?;

    resolve_tier(db, "admission.full_min_popularity", "MARQUEE_FULL_MIN_POPULARITY", &mut admission.full_min_popularity).await?;
    resolve_tier(db, "admission.full_min_votes", "MARQUEE_FULL_MIN_VOTES", &mut admission.full_min_votes).await?;
    resolve_tier(db, "admission.soft_min_popularity", "MARQUEE_SOFT_MIN_POPULARITY", &mut admission.soft_min_popularity).await?;

    resolve_tier(db, "import.parallelism", "MARQUEE_PARALLELISM", &mut import.parallelism).await?;
    resolve_tier(db, "import.max_attempts", "MARQUEE_MAX_ATTEMPTS", &mut import.max_attempts).await?;
    resolve_tier(db, "import.stall_threshold_seconds", "MARQUEE_STALL_THRESHOLD_SECONDS", &mut import.stall_threshold_seconds).await?;

    let mut fuzzy = import.fuzzy_match_threshold.unwrap_or(-1.0);
    resolve_tier(db, "import.fuzzy_match_threshold", "MARQUEE_FUZZY_MATCH_THRESHOLD", &mut fuzzy).await?;
    import.fuzzy_match_threshold = (fuzzy >= 0.0).then_some(fuzzy);

    admission.validate()?;
    import.validate()?;

    let mut catalog = toml_config.catalog.clone();
    catalog.api_key = resolve_catalog_api_key(db, toml_config).await?;

    Ok(IngestConfig {
        admission,
        import,
        catalog,
        ceremony: toml_config.ceremony.clone(),
        max_lock_wait_ms: settings::get_max_lock_wait_ms(db).await?,
    })
}

/// Override `target` from the settings table, else from `env_var`
async fn resolve_tier<T>(db: &SqlitePool, key: &str, env_var: &str, target: &mut T) -> Result<()>
where
    T: FromStr + Display,
    T::Err: Display,
{
    if let Some(value) = settings::get_setting::<T>(db, key).await? {
        debug!(key, value = %value, "Setting loaded from database");
        *target = value;
        return Ok(());
    }

    if let Ok(raw) = std::env::var(env_var) {
        if !raw.trim().is_empty() {
            let value = raw
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("{}={} is invalid: {}", env_var, raw, e)))?;
            debug!(key, value = %value, "Setting loaded from environment");
            *target = value;
        }
    }

    Ok(())
}

/// Resolve the catalog API key
///
/// **Priority:** Database → ENV → TOML. A key is optional; catalogs that
/// need none simply get `None`.
pub async fn resolve_catalog_api_key(
    db: &SqlitePool,
    toml_config: &TomlConfig,
) -> Result<Option<String>> {
    let db_key = settings::get_catalog_api_key(db).await?;
    let env_key = std::env::var(CATALOG_API_KEY_ENV)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = toml_config
        .catalog
        .api_key
        .clone()
        .filter(|k| is_valid_key(k));

    let sources: Vec<&str> = [
        db_key.as_ref().map(|_| "database"),
        env_key.as_ref().map(|_| "environment"),
        toml_key.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            "Catalog API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(source) = sources.first() {
        info!("Catalog API key loaded from {}", source);
    }

    Ok(db_key.or(env_key).or(toml_key))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn test_defaults_without_any_tier() {
        std::env::remove_var("MARQUEE_PARALLELISM");
        std::env::remove_var(CATALOG_API_KEY_ENV);
        let (_dir, pool) = temp_pool().await;

        let config = resolve_ingest_config(&pool, &TomlConfig::default()).await.unwrap();
        assert_eq!(config.admission, AdmissionThresholds::default());
        assert_eq!(config.import.parallelism, 4);
        assert!(config.import.fuzzy_match_threshold.is_none());
        assert!(config.catalog.api_key.is_none());
        assert_eq!(config.max_lock_wait_ms, 5000);
    }

    #[tokio::test]
    #[serial]
    async fn test_database_beats_env_beats_toml() {
        let (_dir, pool) = temp_pool().await;
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [import]
            parallelism = 2
            max_attempts = 9
            "#,
        )
        .unwrap();

        std::env::set_var("MARQUEE_PARALLELISM", "6");
        std::env::set_var("MARQUEE_MAX_ATTEMPTS", "3");
        settings::set_setting(&pool, "import.parallelism", 8).await.unwrap();

        let config = resolve_ingest_config(&pool, &toml_config).await.unwrap();
        std::env::remove_var("MARQUEE_PARALLELISM");
        std::env::remove_var("MARQUEE_MAX_ATTEMPTS");

        assert_eq!(config.import.parallelism, 8);
        assert_eq!(config.import.max_attempts, 3);
    }

    #[tokio::test]
    #[serial]
    async fn test_fuzzy_threshold_enabled_from_toml() {
        std::env::remove_var("MARQUEE_FUZZY_MATCH_THRESHOLD");
        let (_dir, pool) = temp_pool().await;
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [import]
            fuzzy_match_threshold = 0.93
            "#,
        )
        .unwrap();

        let config = resolve_ingest_config(&pool, &toml_config).await.unwrap();
        assert_eq!(config.import.fuzzy_match_threshold, Some(0.93));
    }

    #[tokio::test]
    #[serial]
    async fn test_invalid_thresholds_rejected() {
        std::env::remove_var("MARQUEE_FULL_MIN_POPULARITY");
        let (_dir, pool) = temp_pool().await;
        settings::set_setting(&pool, "admission.full_min_popularity", 0.1).await.unwrap();

        let result = resolve_ingest_config(&pool, &TomlConfig::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_api_key_priority() {
        let (_dir, pool) = temp_pool().await;
        let mut toml_config = TomlConfig::default();
        toml_config.catalog.api_key = Some("from-toml".to_string());

        std::env::set_var(CATALOG_API_KEY_ENV, "from-env");
        assert_eq!(
            resolve_catalog_api_key(&pool, &toml_config).await.unwrap().as_deref(),
            Some("from-env")
        );

        settings::set_catalog_api_key(&pool, "from-db".to_string()).await.unwrap();
        assert_eq!(
            resolve_catalog_api_key(&pool, &toml_config).await.unwrap().as_deref(),
            Some("from-db")
        );
        std::env::remove_var(CATALOG_API_KEY_ENV);
    }
}
