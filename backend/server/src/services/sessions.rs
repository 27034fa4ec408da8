//! Session issuance — opaque access/refresh tokens for humans and
//! short-lived CI sessions for OIDC-verified workloads.
//!
//! Tokens are bare uuids stored in the database; there is no in-process
//! cache and no bearer-token crypto.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::errors::{ApiError, Result};
use crate::models::{b64, CiSession, Delegation, RequestMeta, ServiceRole};

#[derive(Debug, Serialize)]
pub struct AuthTokens {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub refresh_token: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub session_id: Uuid,
}

/// Already-verified OIDC claims. Token verification happens in the transport
/// collaborator; by the time this struct exists the signature, issuer, and
/// audience have been checked.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedClaims {
    pub subject: String,
    pub repository: String,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OidcLoginResponse {
    pub session_id: Uuid,
    pub project_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ProjectKeysRequest {
    pub session_id: Uuid,
    pub project_id: Uuid,
    pub env_name: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectKeysResponse {
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

// ─────────────────────────────────────────────────────────
// Human sessions
// ─────────────────────────────────────────────────────────

/// Mint a fresh access session and refresh token for a user.
pub(crate) async fn issue_tokens(pool: &SqlitePool, user_id: Uuid) -> Result<AuthTokens> {
    let session_id = Uuid::new_v4();
    sqlx::query("INSERT INTO user_sessions (id, user_id, created_at) VALUES (?1, ?2, ?3)")
        .bind(session_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    let refresh_token = Uuid::new_v4();
    sqlx::query("INSERT INTO refresh_tokens (id, user_id, created_at) VALUES (?1, ?2, ?3)")
        .bind(refresh_token)
        .bind(user_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(AuthTokens {
        user_id,
        session_id,
        refresh_token,
    })
}

/// Resolve an access session id to its user, or `SESSION_EXPIRED`.
pub async fn validate_session(pool: &SqlitePool, session_id: Uuid) -> Result<Uuid> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM user_sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(pool)
            .await?;
    row.map(|(user_id,)| user_id).ok_or_else(|| {
        ApiError::unauthorized("SESSION_EXPIRED", "Session is invalid or expired")
    })
}

/// Exchange a refresh token for a new access session. The refresh token
/// stays valid until logout.
pub async fn refresh_session(pool: &SqlitePool, req: RefreshRequest) -> Result<RefreshResponse> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM refresh_tokens WHERE id = ?1")
            .bind(req.refresh_token)
            .fetch_optional(pool)
            .await?;
    let Some((user_id,)) = row else {
        return Err(ApiError::unauthorized(
            "INVALID_REFRESH_TOKEN",
            "Refresh token is invalid or revoked",
        ));
    };

    let session_id = Uuid::new_v4();
    sqlx::query("INSERT INTO user_sessions (id, user_id, created_at) VALUES (?1, ?2, ?3)")
        .bind(session_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(RefreshResponse { session_id })
}

// ─────────────────────────────────────────────────────────
// CI sessions
// ─────────────────────────────────────────────────────────

/// Mint a CI session for a workload whose OIDC token has already been
/// verified. The claimed repository must match a stored service role's
/// principal, and that role must hold a delegation.
pub async fn oidc_login(
    pool: &SqlitePool,
    meta: &RequestMeta,
    claims: VerifiedClaims,
) -> Result<OidcLoginResponse> {
    if claims.repository.is_empty() {
        return Err(ApiError::unauthorized(
            "MISSING_REPO_IDENTITY",
            "Verified claims carry no repository identity",
        ));
    }

    let Some(role) = service_role_by_principal(pool, &claims.repository).await? else {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_OIDC_LOGIN,
            actor_type: audit::ACTOR_SERVICE,
            actor_email: claims.repository.clone(),
            status: audit::STATUS_FAILURE,
            err_msg: Some("no service role for repo principal".to_string()),
            ..Default::default()
        })
        .await;
        return Err(ApiError::not_found(
            "SERVICE_ROLE_NOT_FOUND",
            "No service role is registered for this repository",
        ));
    };

    let Some(delegation) = delegation_for_role(pool, role.id).await? else {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_OIDC_LOGIN,
            actor_type: audit::ACTOR_SERVICE,
            actor_id: role.id.to_string(),
            actor_email: claims.repository.clone(),
            status: audit::STATUS_FAILURE,
            err_msg: Some("service role has no delegation".to_string()),
            ..Default::default()
        })
        .await;
        return Err(ApiError::not_found(
            "DELEGATION_NOT_FOUND",
            "Service role is not delegated to any project",
        )
        .with_hint("Ask a project admin to delegate this service role"));
    };

    let session_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO ci_sessions (id, service_role_id, project_id, env, repo_principal, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(session_id)
    .bind(role.id)
    .bind(delegation.project_id)
    .bind(&delegation.env)
    .bind(&claims.repository)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_OIDC_LOGIN,
        actor_type: audit::ACTOR_SERVICE,
        actor_id: role.id.to_string(),
        actor_email: claims.repository,
        project_id: Some(delegation.project_id),
        environment: Some(delegation.env.clone()),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(OidcLoginResponse {
        session_id,
        project_id: delegation.project_id,
    })
}

/// Hand a CI session the wrapped PRK its delegation carries. The asserted
/// (project, env) must exactly match the session's scope; a mismatch is
/// Forbidden, guarding against session confusion.
pub async fn get_project_keys(
    pool: &SqlitePool,
    meta: &RequestMeta,
    req: ProjectKeysRequest,
) -> Result<ProjectKeysResponse> {
    let session: Option<CiSession> = sqlx::query_as(
        "SELECT id, service_role_id, project_id, env, repo_principal, created_at FROM ci_sessions WHERE id = ?1",
    )
    .bind(req.session_id)
    .fetch_optional(pool)
    .await?;
    let Some(session) = session else {
        return Err(ApiError::not_found("SESSION_NOT_FOUND", "CI session not found"));
    };

    if session.project_id != req.project_id || session.env != req.env_name {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_ENV_PULL,
            actor_type: audit::ACTOR_SERVICE,
            actor_id: session.service_role_id.to_string(),
            actor_email: session.repo_principal.clone(),
            project_id: Some(req.project_id),
            environment: Some(req.env_name.clone()),
            status: audit::STATUS_FAILURE,
            err_msg: Some("session scope mismatch".to_string()),
            ..Default::default()
        })
        .await;
        return Err(ApiError::forbidden(
            "SESSION_SCOPE_MISMATCH",
            "Session is not scoped to this project and environment",
        ));
    }

    let delegation = delegation_for_role(pool, session.service_role_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found("DELEGATION_NOT_FOUND", "Delegation no longer exists")
        })?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_ENV_PULL,
        actor_type: audit::ACTOR_SERVICE,
        actor_id: session.service_role_id.to_string(),
        actor_email: session.repo_principal,
        project_id: Some(session.project_id),
        environment: Some(session.env),
        target_id: Some("project_keys".to_string()),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(ProjectKeysResponse {
        wrapped_prk: delegation.wrapped_prk,
        wrap_nonce: delegation.wrap_nonce,
        ephemeral_public_key: delegation.wrap_ephemeral_pub,
    })
}

pub(crate) async fn service_role_by_principal(
    pool: &SqlitePool,
    repo_principal: &str,
) -> Result<Option<ServiceRole>> {
    let role = sqlx::query_as::<_, ServiceRole>(
        r#"
        SELECT id, name, public_key, repo_principal, created_by, created_at
        FROM   service_roles
        WHERE  repo_principal = ?1
        ORDER  BY created_at ASC
        LIMIT  1
        "#,
    )
    .bind(repo_principal)
    .fetch_optional(pool)
    .await?;
    Ok(role)
}

pub(crate) async fn delegation_for_role(
    pool: &SqlitePool,
    service_role_id: Uuid,
) -> Result<Option<Delegation>> {
    let delegation = sqlx::query_as::<_, Delegation>(
        r#"
        SELECT service_role_id, project_id, env, wrapped_prk, wrap_nonce,
               wrap_ephemeral_pub, delegated_by, created_at
        FROM   delegations
        WHERE  service_role_id = ?1
        "#,
    )
    .bind(service_role_id)
    .fetch_optional(pool)
    .await?;
    Ok(delegation)
}

/// Resolve a CI session by id, for callers that serve env reads.
pub(crate) async fn ci_session(pool: &SqlitePool, session_id: Uuid) -> Result<Option<CiSession>> {
    let session = sqlx::query_as::<_, CiSession>(
        "SELECT id, service_role_id, project_id, env, repo_principal, created_at FROM ci_sessions WHERE id = ?1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(session)
}
