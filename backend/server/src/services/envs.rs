//! The append-only env version log.
//!
//! Versions per (project, env_name) are contiguous from 1; allocation is
//! race-safe through the unique constraint. Ciphertext rows are never
//! rewritten — rotation touches only the wrapped DEK columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::authz;
use crate::db::is_unique_violation;
use crate::errors::{ApiError, FieldError, Result};
use crate::models::{b64, EnvVersion, RequestMeta, Role};
use crate::services::sessions;

#[derive(Debug, Deserialize)]
pub struct PushEnvRequest {
    pub project_id: Uuid,
    pub env_name: String,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub wrapped_dek: Vec<u8>,
    #[serde(with = "b64")]
    pub dek_nonce: Vec<u8>,
    #[serde(default = "default_encryption_version")]
    pub encryption_version: i64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_encryption_version() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct PushEnvResponse {
    pub version: i64,
}

#[derive(Debug, Deserialize)]
pub struct GetEnvRequest {
    pub project_id: Uuid,
    pub env_name: String,
    /// Exact version to fetch; latest when absent.
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EnvPayload {
    pub version: i64,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub wrapped_dek: Vec<u8>,
    #[serde(with = "b64")]
    pub dek_nonce: Vec<u8>,
    pub encryption_version: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListVersionsRequest {
    pub project_id: Uuid,
    pub env_name: String,
}

#[derive(Debug, Serialize)]
pub struct ListVersionsResponse {
    pub env_versions: Vec<EnvPayload>,
}

#[derive(Debug, Deserialize)]
pub struct CiGetEnvRequest {
    pub session_id: Uuid,
}

impl From<EnvVersion> for EnvPayload {
    fn from(row: EnvVersion) -> Self {
        let metadata =
            serde_json::from_str(&row.metadata).unwrap_or(serde_json::Value::Null);
        EnvPayload {
            version: row.version,
            ciphertext: row.ciphertext,
            nonce: row.nonce,
            wrapped_dek: row.wrapped_dek,
            dek_nonce: row.dek_nonce,
            encryption_version: row.encryption_version,
            created_at: row.created_at,
            metadata,
        }
    }
}

/// Append a new version for (project, env_name), allocating
/// `max(existing) + 1`. A concurrent push surfaces as Conflict.
pub async fn push(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: PushEnvRequest,
) -> Result<PushEnvResponse> {
    let user = authz::require_user(pool, user_id).await?;
    if let Err(err) = authz::require_member(pool, req.project_id, user_id, Role::Member).await {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_ENV_PUSH,
            actor_type: audit::ACTOR_USER,
            actor_id: user_id.to_string(),
            actor_email: user.email,
            project_id: Some(req.project_id),
            environment: Some(req.env_name.clone()),
            status: audit::STATUS_FAILURE,
            err_msg: Some(err.code().to_string()),
            ..Default::default()
        })
        .await;
        return Err(err);
    }

    if req.env_name.trim().is_empty() {
        return Err(ApiError::validation(vec![FieldError {
            field: "env_name",
            message: "must not be empty".to_string(),
        }]));
    }

    let version = append(pool, user_id, &req).await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_ENV_PUSH,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(req.project_id),
        environment: Some(req.env_name),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({ "version": version })),
        ..Default::default()
    })
    .await;

    Ok(PushEnvResponse { version })
}

/// Like [`push`], but refuses to create the env: the name must already have
/// at least one version.
pub async fn update(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: PushEnvRequest,
) -> Result<PushEnvResponse> {
    authz::require_member(pool, req.project_id, user_id, Role::Member).await?;

    let (existing,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM env_versions WHERE project_id = ?1 AND env_name = ?2",
    )
    .bind(req.project_id)
    .bind(&req.env_name)
    .fetch_one(pool)
    .await?;
    if existing == 0 {
        return Err(ApiError::not_found(
            "ENV_NOT_FOUND",
            "No env with this name exists in the project",
        )
        .with_hint("Push it first"));
    }

    push(pool, meta, user_id, req).await
}

/// Fetch one version (exact, or latest when unspecified).
pub async fn get(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: GetEnvRequest,
) -> Result<EnvPayload> {
    let user = authz::require_user(pool, user_id).await?;
    if let Err(err) = authz::require_member(pool, req.project_id, user_id, Role::Member).await {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_ENV_PULL,
            actor_type: audit::ACTOR_USER,
            actor_id: user_id.to_string(),
            actor_email: user.email,
            project_id: Some(req.project_id),
            environment: Some(req.env_name.clone()),
            status: audit::STATUS_FAILURE,
            err_msg: Some(err.code().to_string()),
            ..Default::default()
        })
        .await;
        return Err(err);
    }

    let row = fetch_version(pool, req.project_id, &req.env_name, req.version).await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_ENV_PULL,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(req.project_id),
        environment: Some(req.env_name),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({ "version": row.version })),
        ..Default::default()
    })
    .await;

    Ok(row.into())
}

/// All versions for an env, newest first.
pub async fn list_versions(
    pool: &SqlitePool,
    user_id: Uuid,
    req: ListVersionsRequest,
) -> Result<ListVersionsResponse> {
    authz::require_member(pool, req.project_id, user_id, Role::Member).await?;

    let rows = sqlx::query_as::<_, EnvVersion>(
        r#"
        SELECT id, project_id, env_name, version, ciphertext, nonce,
               wrapped_dek, dek_nonce, encryption_version, created_at,
               created_by, metadata
        FROM   env_versions
        WHERE  project_id = ?1 AND env_name = ?2
        ORDER  BY version DESC
        "#,
    )
    .bind(req.project_id)
    .bind(&req.env_name)
    .fetch_all(pool)
    .await?;

    Ok(ListVersionsResponse {
        env_versions: rows.into_iter().map(EnvPayload::from).collect(),
    })
}

/// CI read: the session already encodes (project, env); always the latest.
pub async fn ci_get(
    pool: &SqlitePool,
    meta: &RequestMeta,
    req: CiGetEnvRequest,
) -> Result<EnvPayload> {
    let session = sessions::ci_session(pool, req.session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("SESSION_NOT_FOUND", "CI session not found"))?;

    let row = fetch_version(pool, session.project_id, &session.env, None).await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_ENV_PULL,
        actor_type: audit::ACTOR_SERVICE,
        actor_id: session.service_role_id.to_string(),
        actor_email: session.repo_principal,
        project_id: Some(session.project_id),
        environment: Some(session.env),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({ "version": row.version })),
        ..Default::default()
    })
    .await;

    Ok(row.into())
}

async fn append(pool: &SqlitePool, user_id: Uuid, req: &PushEnvRequest) -> Result<i64> {
    let metadata = match &req.metadata {
        Some(value) => serde_json::to_string(value)
            .map_err(|e| ApiError::Internal(format!("unencodable env metadata: {e}")))?,
        None => "{}".to_string(),
    };

    let mut tx = pool.begin().await?;

    let (version,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM env_versions WHERE project_id = ?1 AND env_name = ?2",
    )
    .bind(req.project_id)
    .bind(&req.env_name)
    .fetch_one(&mut *tx)
    .await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO env_versions
            (id, project_id, env_name, version, ciphertext, nonce,
             wrapped_dek, dek_nonce, encryption_version, created_at,
             created_by, metadata)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(req.project_id)
    .bind(&req.env_name)
    .bind(version)
    .bind(&req.ciphertext)
    .bind(&req.nonce)
    .bind(&req.wrapped_dek)
    .bind(&req.dek_nonce)
    .bind(req.encryption_version)
    .bind(Utc::now())
    .bind(user_id)
    .bind(&metadata)
    .execute(&mut *tx)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            return Err(ApiError::conflict(
                "ENV_VERSION_CONFLICT",
                "A concurrent push claimed this version",
            )
            .with_hint("Retry the push"));
        }
        return Err(err.into());
    }

    tx.commit().await?;
    Ok(version)
}

async fn fetch_version(
    pool: &SqlitePool,
    project_id: Uuid,
    env_name: &str,
    version: Option<i64>,
) -> Result<EnvVersion> {
    let row: Option<EnvVersion> = match version {
        Some(v) => {
            sqlx::query_as(
                r#"
                SELECT id, project_id, env_name, version, ciphertext, nonce,
                       wrapped_dek, dek_nonce, encryption_version, created_at,
                       created_by, metadata
                FROM   env_versions
                WHERE  project_id = ?1 AND env_name = ?2 AND version = ?3
                "#,
            )
            .bind(project_id)
            .bind(env_name)
            .bind(v)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                SELECT id, project_id, env_name, version, ciphertext, nonce,
                       wrapped_dek, dek_nonce, encryption_version, created_at,
                       created_by, metadata
                FROM   env_versions
                WHERE  project_id = ?1 AND env_name = ?2
                ORDER  BY version DESC
                LIMIT  1
                "#,
            )
            .bind(project_id)
            .bind(env_name)
            .fetch_optional(pool)
            .await?
        }
    };

    row.ok_or_else(|| {
        ApiError::not_found("ENV_VERSION_NOT_FOUND", "No such env version")
            .with_hint("Check the env name and version number")
    })
}
