//! Snapshot endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use super::{ApiState, AuthedUser};
use crate::errors::Result;
use crate::models::RequestMeta;
use crate::services::snapshots::{self, ExportRequest, ImportRequest};

/// `POST /snapshots/export`
pub async fn export(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<ExportRequest>,
) -> Result<impl IntoResponse> {
    let exported = snapshots::export(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(exported))
}

/// `POST /snapshots/import` — always bound to the session user; the payload
/// names no actor.
pub async fn import(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<ImportRequest>,
) -> Result<impl IntoResponse> {
    let imported = snapshots::import(&state.pool, &meta, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(imported)))
}
