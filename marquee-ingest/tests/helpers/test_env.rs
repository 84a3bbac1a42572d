//! Temp database plus a fully wired `IngestContext` over mock sources

use marquee_common::events::EventBus;
use marquee_ingest::config::IngestConfig;
use marquee_ingest::queue::{JobQueue, SqliteJobQueue};
use marquee_ingest::IngestContext;
use std::sync::Arc;
use tempfile::TempDir;

use super::mock_sources::{MockCatalog, MockCeremonies};

pub struct TestEnv {
    /// Keeps the database file alive
    pub dir: TempDir,
    pub ctx: IngestContext,
    pub catalog: Arc<MockCatalog>,
    pub ceremonies: Arc<MockCeremonies>,
}

/// Default environment: lenient catalog, immediate retries, 3 attempts
pub async fn test_env() -> TestEnv {
    test_env_with(MockCatalog::new(), |_| {}).await
}

pub async fn test_env_with(catalog: MockCatalog, configure: impl FnOnce(&mut IngestConfig)) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let db = marquee_common::db::init_database(&dir.path().join("test.db"))
        .await
        .unwrap();

    let mut config = IngestConfig::default();
    config.import.max_attempts = 3;
    config.import.backoff_base_ms = 0;
    config.import.max_backoff_ms = 0;
    config.import.lease_seconds = 30;
    config.max_lock_wait_ms = 5000;
    configure(&mut config);

    let catalog = Arc::new(catalog);
    let ceremonies = Arc::new(MockCeremonies::new());
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(db.clone(), &config.import));

    let ctx = IngestContext {
        db,
        catalog: catalog.clone(),
        ceremonies: ceremonies.clone(),
        queue,
        event_bus: EventBus::new(256),
        config: Arc::new(config),
    };

    TestEnv {
        dir,
        ctx,
        catalog,
        ceremonies,
    }
}
