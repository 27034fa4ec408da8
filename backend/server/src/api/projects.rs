//! Project, membership, rotation, and audit endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use super::{ApiState, AuthedUser};
use crate::errors::Result;
use crate::models::RequestMeta;
use crate::services::projects::{
    self, AddUserRequest, AuditLogsRequest, CreateProjectRequest, DeleteProjectRequest,
    GetProjectRequest, SetAccessRequest,
};
use crate::services::rotation::{self, RotateCommitRequest, RotateInitRequest};

/// `POST /projects/create`
pub async fn create(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse> {
    let created = projects::create(&state.pool, &meta, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `POST /projects/list`
pub async fn list(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthedUser>,
) -> Result<impl IntoResponse> {
    let listed = projects::list(&state.pool, user.user_id).await?;
    Ok(Json(listed))
}

/// `POST /projects/get` — the caller's wrapped PRK and the project id.
pub async fn get(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<GetProjectRequest>,
) -> Result<impl IntoResponse> {
    let view = projects::get(&state.pool, user.user_id, req).await?;
    Ok(Json(view))
}

/// `POST /projects/delete`
pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<DeleteProjectRequest>,
) -> Result<impl IntoResponse> {
    projects::delete(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(serde_json::json!({ "message": "project deleted" })))
}

/// `POST /projects/add-user`
pub async fn add_user(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<AddUserRequest>,
) -> Result<impl IntoResponse> {
    projects::add_user(&state.pool, &meta, user.user_id, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "message": "user added to project" })),
    ))
}

/// `POST /projects/set-access`
pub async fn set_access(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<SetAccessRequest>,
) -> Result<impl IntoResponse> {
    projects::set_access(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(serde_json::json!({ "message": "access updated" })))
}

/// `POST /projects/rotate/init`
pub async fn rotate_init(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<RotateInitRequest>,
) -> Result<impl IntoResponse> {
    let snapshot = rotation::init(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(snapshot))
}

/// `POST /projects/rotate/commit`
pub async fn rotate_commit(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<RotateCommitRequest>,
) -> Result<impl IntoResponse> {
    let committed = rotation::commit(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(committed))
}

/// `POST /projects/audit-logs` — admin only.
pub async fn audit_logs(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<AuditLogsRequest>,
) -> Result<impl IntoResponse> {
    let page = projects::audit_logs(&state.pool, user.user_id, req).await?;
    Ok(Json(page))
}
