//! Cursor views and actions
//!
//! GET /cursors, POST /cursors/:stream/resume

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::cursors;
use crate::error::{ApiError, ApiResult};
use crate::models::{CursorStatus, ImportCursor};
use crate::services::ResumeController;
use crate::AppState;

/// GET /cursors query
#[derive(Debug, Default, Deserialize)]
pub struct ListCursorsQuery {
    pub status: Option<String>,
}

/// POST /cursors/:stream/resume response
#[derive(Debug, Serialize)]
pub struct ResumeCursorResponse {
    pub cursor: ImportCursor,
    /// False if the cursor was not stalled
    pub resumed: bool,
}

/// GET /cursors?status=
pub async fn list_cursors(
    State(state): State<AppState>,
    Query(query): Query<ListCursorsQuery>,
) -> ApiResult<Json<Vec<ImportCursor>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<CursorStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(Json(cursors::list_cursors(&state.ctx.db, status).await?))
}

/// POST /cursors/:stream/resume
pub async fn resume_cursor(
    State(state): State<AppState>,
    Path(stream): Path<String>,
) -> ApiResult<Json<ResumeCursorResponse>> {
    if cursors::load_cursor(&state.ctx.db, &stream).await?.is_none() {
        return Err(ApiError::NotFound(format!("cursor {}", stream)));
    }

    let resumed = ResumeController::new(state.ctx.clone())
        .resume_cursor(&stream)
        .await?;
    let cursor = cursors::load_cursor(&state.ctx.db, &stream)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cursor {}", stream)))?;

    Ok(Json(ResumeCursorResponse { cursor, resumed }))
}

/// Build cursor routes
pub fn cursor_routes() -> Router<AppState> {
    Router::new()
        .route("/cursors", get(list_cursors))
        .route("/cursors/:stream/resume", post(resume_cursor))
}
