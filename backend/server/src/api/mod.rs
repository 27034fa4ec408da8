//! Axum REST API — routing, shared state, and middleware.
//!
//! All operations are JSON over POST. Human callers authenticate with the
//! `X-Session-ID` header; CI callers carry their session id in the body.
//! Request id / ip / user-agent are captured once into a [`RequestMeta`]
//! extension and passed explicitly into every service call.

pub mod envs;
pub mod oidc;
pub mod projects;
pub mod service_roles;
pub mod snapshots;
pub mod users;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::RequestMeta;
use crate::services::sessions;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

/// The authenticated human principal, resolved from `X-Session-ID` by the
/// session middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: Arc<ApiState>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/users/register", post(users::register))
        .route("/users/login", post(users::login))
        .route("/users/refresh", post(users::refresh))
        .route("/oidc/github/login", post(oidc::github_login))
        .route("/service-roles/perms", post(service_roles::perms))
        .route("/service-roles/project-keys", post(service_roles::project_keys))
        .route("/env/ci-get", post(envs::ci_get));

    let authed = Router::new()
        .route("/users/logout", post(users::logout))
        .route("/users/public-key", post(users::public_key))
        .route("/projects/create", post(projects::create))
        .route("/projects/list", post(projects::list))
        .route("/projects/get", post(projects::get))
        .route("/projects/delete", post(projects::delete))
        .route("/projects/add-user", post(projects::add_user))
        .route("/projects/set-access", post(projects::set_access))
        .route("/projects/rotate/init", post(projects::rotate_init))
        .route("/projects/rotate/commit", post(projects::rotate_commit))
        .route("/projects/audit-logs", post(projects::audit_logs))
        .route("/env/push", post(envs::push))
        .route("/env/update", post(envs::update))
        .route("/env/get", post(envs::get_env))
        .route("/env/versions", post(envs::versions))
        .route("/service-roles/create", post(service_roles::create))
        .route("/service-roles/list", post(service_roles::list))
        .route("/service-roles/get", post(service_roles::get_role))
        .route("/service-roles/delete", post(service_roles::delete))
        .route("/service-roles/delegate", post(service_roles::delegate))
        .route("/snapshots/export", post(snapshots::export))
        .route("/snapshots/import", post(snapshots::import))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    public
        .merge(authed)
        .layer(middleware::from_fn(capture_request_meta))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve `X-Session-ID` to a user before any membership-gated handler runs.
async fn require_session(
    State(state): State<Arc<ApiState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get("X-Session-ID")
        .and_then(|v| v.to_str().ok());
    let Some(header) = header else {
        return ApiError::unauthorized("SESSION_REQUIRED", "Session ID is required")
            .into_response();
    };
    let Ok(session_id) = Uuid::parse_str(header) else {
        return ApiError::unauthorized("SESSION_INVALID", "Session ID is not a valid uuid")
            .into_response();
    };

    match sessions::validate_session(&state.pool, session_id).await {
        Ok(user_id) => {
            req.extensions_mut().insert(AuthedUser { user_id });
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

/// Capture request id, client ip, and user agent into a [`RequestMeta`]
/// extension for the audit trail.
async fn capture_request_meta(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ip = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
        });

    let user_agent = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    req.extensions_mut().insert(RequestMeta {
        request_id,
        ip,
        user_agent,
    });
    next.run(req).await
}
