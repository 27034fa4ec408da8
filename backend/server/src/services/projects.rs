//! Project lifecycle and membership management.
//!
//! Everything that writes more than one row (create, add-user) runs inside a
//! single transaction, so the key graph can never be observed half-built.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::{self, AuditEntry, AuditPage, AuditQuery};
use crate::authz;
use crate::db::is_unique_violation;
use crate::errors::{ApiError, FieldError, Result};
use crate::models::{b64, Project, RequestMeta, Role, WrappedPrk};
use crate::services::users;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct CreateProjectResponse {
    pub project_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub project_id: Uuid,
    pub name: String,
    pub role: Role,
    pub is_revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct ListProjectsResponse {
    pub projects: Vec<ProjectSummary>,
}

#[derive(Debug, Deserialize)]
pub struct GetProjectRequest {
    pub project_name: String,
}

#[derive(Debug, Serialize)]
pub struct GetProjectResponse {
    pub project_id: Uuid,
    pub prk_version: i64,
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteProjectRequest {
    pub project_name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub project_name: String,
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct SetAccessRequest {
    pub project_name: String,
    pub user_email: String,
    pub is_revoked: bool,
}

#[derive(Debug, Deserialize)]
pub struct AuditLogsRequest {
    pub project_name: String,
    #[serde(flatten)]
    pub query: AuditQuery,
}

/// Create a project. The creator becomes admin and receives the first
/// wrapped-PRK row; all three inserts are one transaction.
pub async fn create(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: CreateProjectRequest,
) -> Result<CreateProjectResponse> {
    let user = authz::require_user(pool, user_id).await?;

    if req.name.trim().is_empty() {
        return Err(ApiError::validation(vec![FieldError {
            field: "name",
            message: "must not be empty".to_string(),
        }]));
    }

    let project_id = Uuid::new_v4();
    let now = Utc::now();

    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO projects (id, name, created_by, prk_version, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
    )
    .bind(project_id)
    .bind(&req.name)
    .bind(user_id)
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            // Release the transaction's connection before the audit write.
            drop(tx);
            audit::log(pool, meta, AuditEntry {
                action: audit::ACTION_PROJECT_CREATE,
                actor_type: audit::ACTOR_USER,
                actor_id: user_id.to_string(),
                actor_email: user.email,
                status: audit::STATUS_FAILURE,
                err_msg: Some("project name already taken".to_string()),
                ..Default::default()
            })
            .await;
            return Err(ApiError::conflict(
                "PROJECT_EXISTS",
                "You already have a project with this name",
            )
            .with_hint("Choose a different project name"));
        }
        return Err(err.into());
    }

    sqlx::query(
        "INSERT INTO project_members (project_id, user_id, role, is_revoked, created_at) VALUES (?1, ?2, 'admin', 0, ?3)",
    )
    .bind(project_id)
    .bind(user_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO wrapped_prks (project_id, user_id, wrapped_prk, wrap_nonce, wrap_ephemeral_pub, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(project_id)
    .bind(user_id)
    .bind(&req.wrapped_prk)
    .bind(&req.wrap_nonce)
    .bind(&req.ephemeral_public_key)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_PROJECT_CREATE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(project_id),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(CreateProjectResponse { project_id })
}

/// All projects the user belongs to, revoked memberships included (flagged).
pub async fn list(pool: &SqlitePool, user_id: Uuid) -> Result<ListProjectsResponse> {
    let rows: Vec<(Uuid, String, Role, bool)> = sqlx::query_as(
        r#"
        SELECT p.id, p.name, m.role, m.is_revoked
        FROM   project_members m
        JOIN   projects p ON p.id = m.project_id
        WHERE  m.user_id = ?1
        ORDER  BY p.created_at ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(ListProjectsResponse {
        projects: rows
            .into_iter()
            .map(|(project_id, name, role, is_revoked)| ProjectSummary {
                project_id,
                name,
                role,
                is_revoked,
            })
            .collect(),
    })
}

/// Fetch the caller's view of a project: its id, the current PRK version,
/// and the caller's own wrapped PRK.
pub async fn get(
    pool: &SqlitePool,
    user_id: Uuid,
    req: GetProjectRequest,
) -> Result<GetProjectResponse> {
    let project = resolve_for_member(pool, user_id, &req.project_name).await?;
    authz::require_member(pool, project.id, user_id, Role::Member).await?;

    let wrapped: Option<WrappedPrk> = sqlx::query_as(
        r#"
        SELECT project_id, user_id, wrapped_prk, wrap_nonce, wrap_ephemeral_pub
        FROM   wrapped_prks
        WHERE  project_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(project.id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let wrapped = wrapped.ok_or_else(|| {
        ApiError::not_found("WRAPPED_PRK_NOT_FOUND", "No wrapped key for this member")
    })?;

    Ok(GetProjectResponse {
        project_id: project.id,
        prk_version: project.prk_version,
        wrapped_prk: wrapped.wrapped_prk,
        wrap_nonce: wrapped.wrap_nonce,
        ephemeral_public_key: wrapped.wrap_ephemeral_pub,
    })
}

/// Delete a project and everything under it. Admin only.
pub async fn delete(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: DeleteProjectRequest,
) -> Result<()> {
    let user = authz::require_user(pool, user_id).await?;
    let project = resolve_for_member(pool, user_id, &req.project_name).await?;

    if let Err(err) = authz::require_member(pool, project.id, user_id, Role::Admin).await {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_PROJECT_DELETE,
            actor_type: audit::ACTOR_USER,
            actor_id: user_id.to_string(),
            actor_email: user.email,
            project_id: Some(project.id),
            status: audit::STATUS_FAILURE,
            err_msg: Some(err.code().to_string()),
            ..Default::default()
        })
        .await;
        return Err(err);
    }

    sqlx::query("DELETE FROM projects WHERE id = ?1")
        .bind(project.id)
        .execute(pool)
        .await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_PROJECT_DELETE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(project.id),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(())
}

/// Add a member. The admin has already wrapped the PRK for the new member's
/// public key; membership and wrapped-PRK rows land in one transaction.
pub async fn add_user(
    pool: &SqlitePool,
    meta: &RequestMeta,
    admin_id: Uuid,
    req: AddUserRequest,
) -> Result<()> {
    let admin = authz::require_user(pool, admin_id).await?;
    let project = resolve_for_member(pool, admin_id, &req.project_name).await?;

    if let Err(err) = authz::require_member(pool, project.id, admin_id, Role::Admin).await {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_MEMBERSHIP_CHANGE,
            actor_type: audit::ACTOR_USER,
            actor_id: admin_id.to_string(),
            actor_email: admin.email,
            project_id: Some(project.id),
            target_id: Some(req.user_id.to_string()),
            status: audit::STATUS_FAILURE,
            err_msg: Some(err.code().to_string()),
            ..Default::default()
        })
        .await;
        return Err(err);
    }

    // The new member must exist before key material can be addressed to them.
    authz::require_user(pool, req.user_id).await?;

    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO project_members (project_id, user_id, role, is_revoked, created_at) VALUES (?1, ?2, 'member', 0, ?3)",
    )
    .bind(project.id)
    .bind(req.user_id)
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            return Err(ApiError::conflict(
                "ALREADY_MEMBER",
                "User is already a member of this project",
            ));
        }
        return Err(err.into());
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO wrapped_prks (project_id, user_id, wrapped_prk, wrap_nonce, wrap_ephemeral_pub, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(project.id)
    .bind(req.user_id)
    .bind(&req.wrapped_prk)
    .bind(&req.wrap_nonce)
    .bind(&req.ephemeral_public_key)
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            return Err(ApiError::conflict(
                "WRAPPED_PRK_EXISTS",
                "A wrapped key already exists for this member",
            ));
        }
        return Err(err.into());
    }

    tx.commit().await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_MEMBERSHIP_CHANGE,
        actor_type: audit::ACTOR_USER,
        actor_id: admin_id.to_string(),
        actor_email: admin.email,
        project_id: Some(project.id),
        target_id: Some(req.user_id.to_string()),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({ "change": "added" })),
        ..Default::default()
    })
    .await;

    Ok(())
}

/// Flip a member's revocation flag. The wrapped-PRK row stays behind for
/// forensics; authorization alone denies a revoked member.
pub async fn set_access(
    pool: &SqlitePool,
    meta: &RequestMeta,
    admin_id: Uuid,
    req: SetAccessRequest,
) -> Result<()> {
    let admin = authz::require_user(pool, admin_id).await?;
    let project = resolve_for_member(pool, admin_id, &req.project_name).await?;
    authz::require_member(pool, project.id, admin_id, Role::Admin).await?;

    let target = users::get_by_email(pool, &req.user_email)
        .await?
        .ok_or_else(|| ApiError::not_found("USER_NOT_FOUND", "User not found"))?;

    let updated = sqlx::query(
        "UPDATE project_members SET is_revoked = ?1 WHERE project_id = ?2 AND user_id = ?3",
    )
    .bind(req.is_revoked)
    .bind(project.id)
    .bind(target.id)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found(
            "MEMBERSHIP_NOT_FOUND",
            "User is not a member of this project",
        ));
    }

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_MEMBERSHIP_CHANGE,
        actor_type: audit::ACTOR_USER,
        actor_id: admin_id.to_string(),
        actor_email: admin.email,
        project_id: Some(project.id),
        target_id: Some(target.id.to_string()),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({ "is_revoked": req.is_revoked })),
        ..Default::default()
    })
    .await;

    Ok(())
}

/// Admin-gated view of a project's audit trail.
pub async fn audit_logs(
    pool: &SqlitePool,
    user_id: Uuid,
    req: AuditLogsRequest,
) -> Result<AuditPage> {
    let project = resolve_for_member(pool, user_id, &req.project_name).await?;
    authz::require_member(pool, project.id, user_id, Role::Admin).await?;
    audit::list_for_project(pool, project.id, &req.query).await
}

/// Resolve a project name from the caller's perspective: a project they
/// created wins; otherwise any project of that name they are a member of.
pub(crate) async fn resolve_for_member(
    pool: &SqlitePool,
    user_id: Uuid,
    name: &str,
) -> Result<Project> {
    let own: Option<Project> = sqlx::query_as(
        "SELECT id, name, created_by, prk_version, created_at FROM projects WHERE name = ?1 AND created_by = ?2",
    )
    .bind(name)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    if let Some(project) = own {
        return Ok(project);
    }

    let member_of: Option<Project> = sqlx::query_as(
        r#"
        SELECT p.id, p.name, p.created_by, p.prk_version, p.created_at
        FROM   projects p
        JOIN   project_members m ON m.project_id = p.id
        WHERE  p.name = ?1 AND m.user_id = ?2
        LIMIT  1
        "#,
    )
    .bind(name)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    member_of.ok_or_else(|| authz::Denied::ProjectNotFound.into_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::services::users::RegisterRequest;

    fn meta() -> RequestMeta {
        RequestMeta::default()
    }

    async fn register(pool: &SqlitePool, email: &str) -> Uuid {
        users::register(pool, &meta(), RegisterRequest {
            email: email.to_string(),
            password: "a strong password".to_string(),
            public_key: vec![1],
            enc_private_key: vec![2],
            enc_private_key_salt: vec![3],
            enc_private_key_nonce: vec![4],
        })
        .await
        .unwrap()
        .user_id
    }

    fn create_req(name: &str) -> CreateProjectRequest {
        CreateProjectRequest {
            name: name.to_string(),
            wrapped_prk: vec![0xAA, 0xAA],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        }
    }

    #[tokio::test]
    async fn create_makes_creator_admin_with_wrapped_key() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;

        let created = create(&pool, &meta(), alice, create_req("P")).await.unwrap();

        let view = get(&pool, alice, GetProjectRequest {
            project_name: "P".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(view.project_id, created.project_id);
        assert_eq!(view.prk_version, 1);
        assert_eq!(view.wrapped_prk, vec![0xAA, 0xAA]);

        let listed = list(&pool, alice).await.unwrap();
        assert_eq!(listed.projects.len(), 1);
        assert_eq!(listed.projects[0].role, Role::Admin);
    }

    #[tokio::test]
    async fn duplicate_name_same_creator_conflicts() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;
        create(&pool, &meta(), alice, create_req("P")).await.unwrap();

        let err = create(&pool, &meta(), alice, create_req("P")).await.unwrap_err();
        assert_eq!(err.code(), "PROJECT_EXISTS");

        // A different creator may reuse the name.
        let bob = register(&pool, "bob@example.com").await;
        create(&pool, &meta(), bob, create_req("P")).await.unwrap();
    }

    #[tokio::test]
    async fn add_user_requires_admin_and_writes_nothing_on_denial() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;
        let bob = register(&pool, "bob@example.com").await;
        let carol = register(&pool, "carol@example.com").await;
        create(&pool, &meta(), alice, create_req("P")).await.unwrap();

        add_user(&pool, &meta(), alice, AddUserRequest {
            project_name: "P".to_string(),
            user_id: bob,
            wrapped_prk: vec![0xBB, 0xBB],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        })
        .await
        .unwrap();

        // Bob is a plain member: he may not add Carol.
        let err = add_user(&pool, &meta(), bob, AddUserRequest {
            project_name: "P".to_string(),
            user_id: carol,
            wrapped_prk: vec![0xCC],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ADMIN_REQUIRED");

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM project_members WHERE user_id = ?1")
                .bind(carol)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn adding_twice_conflicts() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;
        let bob = register(&pool, "bob@example.com").await;
        create(&pool, &meta(), alice, create_req("P")).await.unwrap();

        let add = AddUserRequest {
            project_name: "P".to_string(),
            user_id: bob,
            wrapped_prk: vec![0xBB],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        };
        add_user(&pool, &meta(), alice, add).await.unwrap();

        let err = add_user(&pool, &meta(), alice, AddUserRequest {
            project_name: "P".to_string(),
            user_id: bob,
            wrapped_prk: vec![0xBB],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ALREADY_MEMBER");
    }

    #[tokio::test]
    async fn revocation_keeps_wrapped_key_for_forensics() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;
        let bob = register(&pool, "bob@example.com").await;
        let created = create(&pool, &meta(), alice, create_req("P")).await.unwrap();
        add_user(&pool, &meta(), alice, AddUserRequest {
            project_name: "P".to_string(),
            user_id: bob,
            wrapped_prk: vec![0xBB],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        })
        .await
        .unwrap();

        set_access(&pool, &meta(), alice, SetAccessRequest {
            project_name: "P".to_string(),
            user_email: "bob@example.com".to_string(),
            is_revoked: true,
        })
        .await
        .unwrap();

        let err = get(&pool, bob, GetProjectRequest {
            project_name: "P".to_string(),
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ACCESS_REVOKED");

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM wrapped_prks WHERE project_id = ?1 AND user_id = ?2",
        )
        .bind(created.project_id)
        .bind(bob)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn delete_cascades() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;
        let created = create(&pool, &meta(), alice, create_req("P")).await.unwrap();

        delete(&pool, &meta(), alice, DeleteProjectRequest {
            project_name: "P".to_string(),
        })
        .await
        .unwrap();

        let (members,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM project_members WHERE project_id = ?1")
                .bind(created.project_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        let (keys,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM wrapped_prks WHERE project_id = ?1")
                .bind(created.project_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(members, 0);
        assert_eq!(keys, 0);
    }

    #[tokio::test]
    async fn audit_logs_are_admin_only() {
        let pool = test_pool().await;
        let alice = register(&pool, "alice@example.com").await;
        let bob = register(&pool, "bob@example.com").await;
        create(&pool, &meta(), alice, create_req("P")).await.unwrap();
        add_user(&pool, &meta(), alice, AddUserRequest {
            project_name: "P".to_string(),
            user_id: bob,
            wrapped_prk: vec![0xBB],
            wrap_nonce: vec![1],
            ephemeral_public_key: vec![2],
        })
        .await
        .unwrap();

        let page = audit_logs(&pool, alice, AuditLogsRequest {
            project_name: "P".to_string(),
            query: AuditQuery::default(),
        })
        .await
        .unwrap();
        assert!(page.total >= 2); // create + membership change

        let err = audit_logs(&pool, bob, AuditLogsRequest {
            project_name: "P".to_string(),
            query: AuditQuery::default(),
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ADMIN_REQUIRED");
    }
}
