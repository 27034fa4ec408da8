//! User endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use super::{ApiState, AuthedUser};
use crate::errors::Result;
use crate::models::RequestMeta;
use crate::services::sessions::{self, RefreshRequest};
use crate::services::users::{self, LoginRequest, PublicKeyRequest, RegisterRequest};

/// `POST /users/register`
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let tokens = users::register(&state.pool, &meta, req).await?;
    Ok((StatusCode::CREATED, Json(tokens)))
}

/// `POST /users/login`
pub async fn login(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let tokens = users::login(&state.pool, &meta, req).await?;
    Ok(Json(tokens))
}

/// `POST /users/logout` — deletes every access and refresh token.
pub async fn logout(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<impl IntoResponse> {
    users::logout(&state.pool, &meta, user.user_id).await?;
    Ok(Json(serde_json::json!({ "message": "logged out" })))
}

/// `POST /users/refresh`
pub async fn refresh(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse> {
    let refreshed = sessions::refresh_session(&state.pool, req).await?;
    Ok(Json(refreshed))
}

/// `POST /users/public-key` — look up a user's public key by email.
pub async fn public_key(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PublicKeyRequest>,
) -> Result<impl IntoResponse> {
    let found = users::search_public_key(&state.pool, req).await?;
    Ok(Json(found))
}
