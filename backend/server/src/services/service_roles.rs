//! Service roles — workload identities bound to a repository principal —
//! and their delegation to a single (project, env).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::authz;
use crate::db::is_unique_violation;
use crate::errors::{ApiError, FieldError, Result};
use crate::models::{b64, RequestMeta, Role, ServiceRole};
use crate::services::sessions;

#[derive(Debug, Deserialize)]
pub struct CreateServiceRoleRequest {
    pub service_role_name: String,
    #[serde(with = "b64")]
    pub service_role_public_key: Vec<u8>,
    pub repo_principal: String,
}

#[derive(Debug, Serialize)]
pub struct ServiceRoleView {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "b64")]
    pub service_role_public_key: Vec<u8>,
    pub repo_principal: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<ServiceRole> for ServiceRoleView {
    fn from(row: ServiceRole) -> Self {
        ServiceRoleView {
            id: row.id,
            name: row.name,
            service_role_public_key: row.public_key,
            repo_principal: row.repo_principal,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceRoleListResponse {
    pub service_roles: Vec<ServiceRoleView>,
}

#[derive(Debug, Deserialize)]
pub struct GetServiceRoleRequest {
    pub repo_principal: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteServiceRoleRequest {
    pub service_role_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub project_id: Uuid,
    pub env_name: String,
    pub repo_principal: String,
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct PermsRequest {
    pub repo_principal: String,
}

#[derive(Debug, Serialize)]
pub struct PermsResponse {
    pub project_id: Uuid,
    pub project_name: String,
    pub env: String,
}

pub async fn create(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: CreateServiceRoleRequest,
) -> Result<ServiceRoleView> {
    let creator = authz::require_user(pool, user_id).await?;

    let mut fields = Vec::new();
    if req.service_role_name.trim().is_empty() {
        fields.push(FieldError {
            field: "service_role_name",
            message: "must not be empty".to_string(),
        });
    }
    if req.repo_principal.trim().is_empty() {
        fields.push(FieldError {
            field: "repo_principal",
            message: "must not be empty".to_string(),
        });
    }
    if !fields.is_empty() {
        return Err(ApiError::validation(fields));
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    let inserted = sqlx::query(
        r#"
        INSERT INTO service_roles (id, name, public_key, repo_principal, created_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(id)
    .bind(&req.service_role_name)
    .bind(&req.service_role_public_key)
    .bind(&req.repo_principal)
    .bind(user_id)
    .bind(now)
    .execute(pool)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            audit::log(pool, meta, AuditEntry {
                action: audit::ACTION_SERVICE_ROLE_CREATE,
                actor_type: audit::ACTOR_USER,
                actor_id: user_id.to_string(),
                actor_email: creator.email,
                status: audit::STATUS_FAILURE,
                err_msg: Some("service role already exists".to_string()),
                ..Default::default()
            })
            .await;
            return Err(ApiError::conflict(
                "SERVICE_ROLE_EXISTS",
                "A service role with this name and principal already exists",
            )
            .with_hint("Choose a different name or principal"));
        }
        return Err(err.into());
    }

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_SERVICE_ROLE_CREATE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: creator.email,
        target_id: Some(id.to_string()),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(ServiceRoleView {
        id,
        name: req.service_role_name,
        service_role_public_key: req.service_role_public_key,
        repo_principal: req.repo_principal,
        created_by: user_id,
        created_at: now,
    })
}

/// Service roles created by the caller.
pub async fn list(pool: &SqlitePool, user_id: Uuid) -> Result<ServiceRoleListResponse> {
    let rows = sqlx::query_as::<_, ServiceRole>(
        r#"
        SELECT id, name, public_key, repo_principal, created_by, created_at
        FROM   service_roles
        WHERE  created_by = ?1
        ORDER  BY created_at ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(ServiceRoleListResponse {
        service_roles: rows.into_iter().map(ServiceRoleView::from).collect(),
    })
}

pub async fn get(pool: &SqlitePool, req: GetServiceRoleRequest) -> Result<ServiceRoleView> {
    let role = sessions::service_role_by_principal(pool, &req.repo_principal)
        .await?
        .ok_or_else(|| ApiError::not_found("SERVICE_ROLE_NOT_FOUND", "Service role not found"))?;
    Ok(role.into())
}

/// Only the creator may delete a service role; the delegation and any CI
/// sessions cascade away with it.
pub async fn delete(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: DeleteServiceRoleRequest,
) -> Result<()> {
    let actor = authz::require_user(pool, user_id).await?;

    let role: Option<ServiceRole> = sqlx::query_as(
        "SELECT id, name, public_key, repo_principal, created_by, created_at FROM service_roles WHERE id = ?1",
    )
    .bind(req.service_role_id)
    .fetch_optional(pool)
    .await?;
    let Some(role) = role else {
        return Err(ApiError::not_found(
            "SERVICE_ROLE_NOT_FOUND",
            "Service role not found",
        ));
    };

    if role.created_by != user_id {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_SERVICE_ROLE_DELETE,
            actor_type: audit::ACTOR_USER,
            actor_id: user_id.to_string(),
            actor_email: actor.email,
            target_id: Some(role.id.to_string()),
            status: audit::STATUS_FAILURE,
            err_msg: Some("not the creator".to_string()),
            ..Default::default()
        })
        .await;
        return Err(ApiError::forbidden(
            "NOT_CREATOR",
            "Only the creator can delete this service role",
        ));
    }

    sqlx::query("DELETE FROM service_roles WHERE id = ?1")
        .bind(role.id)
        .execute(pool)
        .await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_SERVICE_ROLE_DELETE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: actor.email,
        target_id: Some(role.id.to_string()),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(())
}

/// Grant a service role read access to one (project, env). The wrapped PRK
/// here is sealed for the service role's public key, not a user's.
pub async fn delegate(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: DelegateRequest,
) -> Result<()> {
    let actor = authz::require_user(pool, user_id).await?;
    authz::require_member(pool, req.project_id, user_id, Role::Admin).await?;

    let role = sessions::service_role_by_principal(pool, &req.repo_principal)
        .await?
        .ok_or_else(|| ApiError::not_found("SERVICE_ROLE_NOT_FOUND", "Service role not found"))?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO delegations
            (service_role_id, project_id, env, wrapped_prk, wrap_nonce,
             wrap_ephemeral_pub, delegated_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(role.id)
    .bind(req.project_id)
    .bind(&req.env_name)
    .bind(&req.wrapped_prk)
    .bind(&req.wrap_nonce)
    .bind(&req.ephemeral_public_key)
    .bind(user_id)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            audit::log(pool, meta, AuditEntry {
                action: audit::ACTION_SERVICE_ROLE_DELEGATE,
                actor_type: audit::ACTOR_USER,
                actor_id: user_id.to_string(),
                actor_email: actor.email,
                project_id: Some(req.project_id),
                environment: Some(req.env_name.clone()),
                target_id: Some(role.id.to_string()),
                status: audit::STATUS_FAILURE,
                err_msg: Some("already delegated".to_string()),
                ..Default::default()
            })
            .await;
            return Err(ApiError::conflict(
                "ALREADY_DELEGATED",
                "Service role is already delegated to a project",
            ));
        }
        return Err(err.into());
    }

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_SERVICE_ROLE_DELEGATE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: actor.email,
        project_id: Some(req.project_id),
        environment: Some(req.env_name),
        target_id: Some(role.id.to_string()),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(())
}

/// Which (project, env) a repo principal is delegated to — the CI
/// pre-flight. Returns no key material.
pub async fn perms(pool: &SqlitePool, req: PermsRequest) -> Result<PermsResponse> {
    let role = sessions::service_role_by_principal(pool, &req.repo_principal)
        .await?
        .ok_or_else(|| ApiError::not_found("SERVICE_ROLE_NOT_FOUND", "Service role not found"))?;

    let row: Option<(Uuid, String, String)> = sqlx::query_as(
        r#"
        SELECT d.project_id, p.name, d.env
        FROM   delegations d
        JOIN   projects p ON p.id = d.project_id
        WHERE  d.service_role_id = ?1
        "#,
    )
    .bind(role.id)
    .fetch_optional(pool)
    .await?;

    let Some((project_id, project_name, env)) = row else {
        return Err(ApiError::not_found(
            "DELEGATION_NOT_FOUND",
            "Service role is not delegated to any project",
        )
        .with_hint("Ask a project admin to delegate this service role"));
    };

    Ok(PermsResponse {
        project_id,
        project_name,
        env,
    })
}
