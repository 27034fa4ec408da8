//! Service-role and delegation endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use super::{ApiState, AuthedUser};
use crate::errors::Result;
use crate::models::RequestMeta;
use crate::services::service_roles::{
    self, CreateServiceRoleRequest, DelegateRequest, DeleteServiceRoleRequest,
    GetServiceRoleRequest, PermsRequest,
};
use crate::services::sessions::{self, ProjectKeysRequest};

/// `POST /service-roles/create`
pub async fn create(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<CreateServiceRoleRequest>,
) -> Result<impl IntoResponse> {
    let role = service_roles::create(&state.pool, &meta, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// `POST /service-roles/list`
pub async fn list(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthedUser>,
) -> Result<impl IntoResponse> {
    let listed = service_roles::list(&state.pool, user.user_id).await?;
    Ok(Json(listed))
}

/// `POST /service-roles/get`
pub async fn get_role(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<GetServiceRoleRequest>,
) -> Result<impl IntoResponse> {
    let role = service_roles::get(&state.pool, req).await?;
    Ok(Json(role))
}

/// `POST /service-roles/delete`
pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<DeleteServiceRoleRequest>,
) -> Result<impl IntoResponse> {
    service_roles::delete(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(serde_json::json!({ "message": "service role deleted" })))
}

/// `POST /service-roles/delegate`
pub async fn delegate(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<DelegateRequest>,
) -> Result<impl IntoResponse> {
    service_roles::delegate(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(serde_json::json!({ "message": "service role delegated" })))
}

/// `POST /service-roles/perms` — delegation lookup by repo principal.
pub async fn perms(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PermsRequest>,
) -> Result<impl IntoResponse> {
    let perms = service_roles::perms(&state.pool, req).await?;
    Ok(Json(perms))
}

/// `POST /service-roles/project-keys` — the delegated wrapped PRK, gated on
/// an exact (project, env) match with the CI session.
pub async fn project_keys(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ProjectKeysRequest>,
) -> Result<impl IntoResponse> {
    let keys = sessions::get_project_keys(&state.pool, &meta, req).await?;
    Ok(Json(keys))
}
