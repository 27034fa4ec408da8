//! Workload-identity login.
//!
//! Token verification (signature, issuer, audience, JWKS) happens in the
//! deployment's verification collaborator in front of this endpoint; the
//! body is the already-verified claim set.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use super::ApiState;
use crate::errors::Result;
use crate::models::RequestMeta;
use crate::services::sessions::{self, VerifiedClaims};

/// `POST /oidc/github/login`
pub async fn github_login(
    State(state): State<Arc<ApiState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(claims): Json<VerifiedClaims>,
) -> Result<impl IntoResponse> {
    let session = sessions::oidc_login(&state.pool, &meta, claims).await?;
    Ok(Json(session))
}
