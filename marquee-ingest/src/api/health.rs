//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::queue::{QueueCounts, ALL_QUEUES};
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the queue cannot be read
    pub status: String,
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Job counts per logical queue
    pub queues: BTreeMap<String, QueueCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let mut queues = BTreeMap::new();
    let mut last_error = None;
    for queue in ALL_QUEUES {
        match state.ctx.queue.counts(queue).await {
            Ok(counts) => {
                queues.insert(queue.to_string(), counts);
            }
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Json(HealthResponse {
        status: if last_error.is_none() { "ok" } else { "degraded" }.to_string(),
        module: "marquee-ingest".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        queues,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
