//! Manifest views and actions
//!
//! GET /manifests, GET /manifests/:id, POST /manifests/:id/resume,
//! POST /manifests/:id/abandon

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::manifests;
use crate::error::{ApiError, ApiResult};
use crate::models::{BatchStatus, ImportManifest, ManifestEntity, ManifestRelation, ManifestSummary};
use crate::services::{ManifestPlan, ResumeController};
use crate::AppState;

/// GET /manifests query
#[derive(Debug, Default, Deserialize)]
pub struct ListManifestsQuery {
    pub status: Option<String>,
}

/// One row of GET /manifests
#[derive(Debug, Serialize)]
pub struct ManifestListItem {
    #[serde(flatten)]
    pub manifest: ImportManifest,
    pub summary: ManifestSummary,
}

/// GET /manifests/:id response
#[derive(Debug, Serialize)]
pub struct ManifestDetailResponse {
    pub manifest: ImportManifest,
    pub summary: ManifestSummary,
    pub entities: Vec<ManifestEntity>,
    pub relations: Vec<ManifestRelation>,
}

/// POST /manifests/:id/resume response
#[derive(Debug, Serialize)]
pub struct ResumeManifestResponse {
    pub manifest_id: Uuid,
    /// Status after the resume was prepared
    pub status: BatchStatus,
    pub plan: ManifestPlan,
    pub jobs_queued: usize,
}

/// POST /manifests/:id/abandon request
#[derive(Debug, Default, Deserialize)]
pub struct AbandonManifestRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /manifests/:id/abandon response
#[derive(Debug, Serialize)]
pub struct AbandonManifestResponse {
    pub manifest_id: Uuid,
    pub status: BatchStatus,
    /// False if the batch was already failed
    pub changed: bool,
}

/// GET /manifests?status=
pub async fn list_manifests(
    State(state): State<AppState>,
    Query(query): Query<ListManifestsQuery>,
) -> ApiResult<Json<Vec<ManifestListItem>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<BatchStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let db = &state.ctx.db;
    let mut items = Vec::new();
    for manifest in manifests::list_manifests(db, status).await? {
        let summary = manifests::summarize(db, manifest.manifest_id).await?;
        items.push(ManifestListItem { manifest, summary });
    }
    Ok(Json(items))
}

/// GET /manifests/:id
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<Uuid>,
) -> ApiResult<Json<ManifestDetailResponse>> {
    let db = &state.ctx.db;
    let manifest = manifests::load_manifest(db, manifest_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("manifest {}", manifest_id)))?;

    Ok(Json(ManifestDetailResponse {
        summary: manifests::summarize(db, manifest_id).await?,
        entities: manifests::load_entities(db, manifest_id, None).await?,
        relations: manifests::load_relations(db, manifest_id, None).await?,
        manifest,
    }))
}

/// POST /manifests/:id/resume
///
/// Resets failed entries and relations and queues the remaining work; the
/// workers pick it up.
pub async fn resume_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<Uuid>,
) -> ApiResult<Json<ResumeManifestResponse>> {
    let controller = ResumeController::new(state.ctx.clone());
    let jobs_queued = controller.enqueue_manifest_resume(manifest_id).await?;
    let plan = controller.plan_manifest(manifest_id).await?;

    Ok(Json(ResumeManifestResponse {
        manifest_id,
        status: plan.status,
        plan,
        jobs_queued,
    }))
}

/// POST /manifests/:id/abandon
///
/// 409 Conflict for a batch that already completed.
pub async fn abandon_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<Uuid>,
    Json(request): Json<AbandonManifestRequest>,
) -> ApiResult<Json<AbandonManifestResponse>> {
    let reason = request.reason.unwrap_or_else(|| "operator request".to_string());
    let changed = ResumeController::new(state.ctx.clone())
        .abandon_manifest(manifest_id, &reason)
        .await?;
    let manifest = manifests::require_manifest(&state.ctx.db, manifest_id).await?;

    Ok(Json(AbandonManifestResponse {
        manifest_id,
        status: manifest.status,
        changed,
    }))
}

/// Build manifest routes
pub fn manifest_routes() -> Router<AppState> {
    Router::new()
        .route("/manifests", get(list_manifests))
        .route("/manifests/:id", get(get_manifest))
        .route("/manifests/:id/resume", post(resume_manifest))
        .route("/manifests/:id/abandon", post(abandon_manifest))
}
