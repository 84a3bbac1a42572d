//! marquee-ingest library interface
//!
//! Import orchestration and entity resolution for movies, people and award
//! nominations. Exposes the services for the binary and integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, IngestError, IngestResult};

use axum::Router;
use chrono::{DateTime, Utc};
use marquee_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::IngestConfig;
use crate::queue::JobQueue;
use crate::services::{CatalogSource, CeremonySource};

/// Everything a unit of work needs: storage, sources, queue and tunables
///
/// Cheap to clone; every field is a handle.
#[derive(Clone)]
pub struct IngestContext {
    pub db: SqlitePool,
    pub catalog: Arc<dyn CatalogSource>,
    pub ceremonies: Arc<dyn CeremonySource>,
    pub queue: Arc<dyn JobQueue>,
    pub event_bus: EventBus,
    pub config: Arc<IngestConfig>,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ctx: IngestContext,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            ctx,
            startup_time: Utc::now(),
        }
    }
}

/// Build the operator API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::manifest_routes())
        .merge(api::cursor_routes())
        .merge(api::admission_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
