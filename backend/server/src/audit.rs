//! Audit trail — structured append of every privileged decision.
//!
//! Audit writes must never fail the calling operation: errors are logged and
//! swallowed.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::error;
use uuid::Uuid;

use crate::errors::{ApiError, Result};
use crate::models::{AuditRecord, RequestMeta};

pub const ACTOR_USER: &str = "user";
pub const ACTOR_SERVICE: &str = "service";
pub const ACTOR_SYSTEM: &str = "system";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILURE: &str = "failure";

pub const ACTION_REGISTER: &str = "register";
pub const ACTION_LOGIN: &str = "login";
pub const ACTION_LOGOUT: &str = "logout";
pub const ACTION_OIDC_LOGIN: &str = "oidc.login";
pub const ACTION_ENV_PUSH: &str = "env.push";
pub const ACTION_ENV_PULL: &str = "env.pull";
pub const ACTION_PRK_ROTATE: &str = "prk.rotate";
pub const ACTION_MEMBERSHIP_CHANGE: &str = "membership.change";
pub const ACTION_PROJECT_CREATE: &str = "project.create";
pub const ACTION_PROJECT_DELETE: &str = "project.delete";
pub const ACTION_SERVICE_ROLE_CREATE: &str = "service_role.create";
pub const ACTION_SERVICE_ROLE_DELETE: &str = "service_role.delete";
pub const ACTION_SERVICE_ROLE_DELEGATE: &str = "service_role.delegate";
pub const ACTION_SNAPSHOT_EXPORT: &str = "snapshot.export";
pub const ACTION_SNAPSHOT_IMPORT: &str = "snapshot.import";

#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub action: &'static str,
    pub actor_type: &'static str,
    pub actor_id: String,
    pub actor_email: String,
    pub project_id: Option<Uuid>,
    pub environment: Option<String>,
    pub target_id: Option<String>,
    pub status: &'static str,
    pub err_msg: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Append an audit row for a decision that has already been made.
pub async fn log(pool: &SqlitePool, meta: &RequestMeta, mut entry: AuditEntry) {
    if entry.actor_type.is_empty() {
        entry.actor_type = ACTOR_SYSTEM;
    }
    if entry.actor_id.is_empty() {
        entry.actor_id = "system".to_string();
    }
    if entry.actor_email.is_empty() {
        entry.actor_email = "system@envlock".to_string();
    }
    let request_id = if meta.request_id.is_empty() {
        "unknown_request"
    } else {
        meta.request_id.as_str()
    };

    if let Err(err) = insert(pool, meta, request_id, &entry).await {
        error!("failed to write audit log: {err}");
    }
}

async fn insert(
    pool: &SqlitePool,
    meta: &RequestMeta,
    request_id: &str,
    entry: &AuditEntry,
) -> Result<()> {
    let metadata = entry
        .metadata
        .as_ref()
        .map(|m| serde_json::to_string(m))
        .transpose()
        .map_err(|e| ApiError::Internal(format!("unencodable audit metadata: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO audit_logs
            (id, ts, request_id, actor_type, actor_id, actor_email, action,
             project_id, environment, target_id, ip_address, user_agent,
             status, error_message, metadata)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(Utc::now())
    .bind(request_id)
    .bind(entry.actor_type)
    .bind(&entry.actor_id)
    .bind(&entry.actor_email)
    .bind(entry.action)
    .bind(entry.project_id)
    .bind(&entry.environment)
    .bind(&entry.target_id)
    .bind(&meta.ip)
    .bind(&meta.user_agent)
    .bind(entry.status)
    .bind(&entry.err_msg)
    .bind(metadata)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Audit queries
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub actor_email: Option<String>,
    pub action: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, serde::Serialize)]
pub struct AuditPage {
    pub logs: Vec<AuditRecord>,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

/// Fetch a filtered, paginated slice of a project's audit trail, newest
/// first. Authorization is the caller's responsibility.
pub async fn list_for_project(
    pool: &SqlitePool,
    project_id: Uuid,
    query: &AuditQuery,
) -> Result<AuditPage> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let (total,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM audit_logs
        WHERE  project_id = ?1
          AND  (?2 IS NULL OR actor_email = ?2)
          AND  (?3 IS NULL OR action = ?3)
          AND  (?4 IS NULL OR status = ?4)
          AND  (?5 IS NULL OR ts >= ?5)
          AND  (?6 IS NULL OR ts <= ?6)
        "#,
    )
    .bind(project_id)
    .bind(&query.actor_email)
    .bind(&query.action)
    .bind(&query.status)
    .bind(query.from)
    .bind(query.to)
    .fetch_one(pool)
    .await?;

    let logs = sqlx::query_as::<_, AuditRecord>(
        r#"
        SELECT id, ts, request_id, actor_type, actor_id, actor_email, action,
               project_id, environment, target_id, ip_address, user_agent,
               status, error_message, metadata
        FROM   audit_logs
        WHERE  project_id = ?1
          AND  (?2 IS NULL OR actor_email = ?2)
          AND  (?3 IS NULL OR action = ?3)
          AND  (?4 IS NULL OR status = ?4)
          AND  (?5 IS NULL OR ts >= ?5)
          AND  (?6 IS NULL OR ts <= ?6)
        ORDER  BY ts DESC
        LIMIT  ?7 OFFSET ?8
        "#,
    )
    .bind(project_id)
    .bind(&query.actor_email)
    .bind(&query.action)
    .bind(&query.status)
    .bind(query.from)
    .bind(query.to)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(AuditPage {
        logs,
        limit,
        offset,
        total,
    })
}
