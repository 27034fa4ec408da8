//! Env version endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use super::{ApiState, AuthedUser};
use crate::errors::Result;
use crate::models::RequestMeta;
use crate::services::envs::{
    self, CiGetEnvRequest, GetEnvRequest, ListVersionsRequest, PushEnvRequest,
};

/// `POST /env/push`
pub async fn push(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<PushEnvRequest>,
) -> Result<impl IntoResponse> {
    let pushed = envs::push(&state.pool, &meta, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(pushed)))
}

/// `POST /env/update` — append-only; the env must already exist.
pub async fn update(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<PushEnvRequest>,
) -> Result<impl IntoResponse> {
    let pushed = envs::update(&state.pool, &meta, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(pushed)))
}

/// `POST /env/get` — exact version, or latest when unspecified.
pub async fn get_env(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<GetEnvRequest>,
) -> Result<impl IntoResponse> {
    let payload = envs::get(&state.pool, &meta, user.user_id, req).await?;
    Ok(Json(payload))
}

/// `POST /env/versions`
pub async fn versions(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<ListVersionsRequest>,
) -> Result<impl IntoResponse> {
    let listed = envs::list_versions(&state.pool, user.user_id, req).await?;
    Ok(Json(listed))
}

/// `POST /env/ci-get` — latest version for the CI session's (project, env).
pub async fn ci_get(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CiGetEnvRequest>,
) -> Result<impl IntoResponse> {
    let payload = envs::ci_get(&state.pool, &meta, req).await?;
    Ok(Json(payload))
}
