//! Admission audit log
//!
//! GET /admissions?tier=&limit=

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::admissions;
use crate::error::{ApiError, ApiResult};
use crate::models::admission::AdmissionRecord;
use crate::models::AdmissionTier;
use crate::AppState;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

/// GET /admissions query
#[derive(Debug, Default, Deserialize)]
pub struct ListAdmissionsQuery {
    pub tier: Option<String>,
    pub limit: Option<u32>,
}

/// GET /admissions response
#[derive(Debug, Serialize)]
pub struct AdmissionsResponse {
    /// Totals per tier across the whole log
    pub totals: BTreeMap<String, i64>,
    pub decisions: Vec<AdmissionRecord>,
}

/// GET /admissions
pub async fn list_admissions(
    State(state): State<AppState>,
    Query(query): Query<ListAdmissionsQuery>,
) -> ApiResult<Json<AdmissionsResponse>> {
    let tier = query
        .tier
        .as_deref()
        .map(str::parse::<AdmissionTier>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let totals = admissions::count_by_tier(&state.ctx.db)
        .await?
        .into_iter()
        .map(|(tier, count)| (tier.as_str().to_string(), count))
        .collect();
    let decisions = admissions::list_decisions(&state.ctx.db, tier, limit).await?;

    Ok(Json(AdmissionsResponse { totals, decisions }))
}

/// Build admission routes
pub fn admission_routes() -> Router<AppState> {
    Router::new().route("/admissions", get(list_admissions))
}
