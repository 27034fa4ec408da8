//! Authorization gate — the single membership predicate every operation
//! consults before touching wrapped key material.
//!
//! Service-role callers don't come through here; their check is delegation
//! existence plus an exact (project, env) match on the CI session.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::{ApiError, Result};
use crate::models::{Membership, Role, User};

/// Why the gate said no.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    NotMember,
    Revoked,
    InsufficientRole,
    ProjectNotFound,
    UserNotFound,
}

impl Denied {
    pub fn into_error(self) -> ApiError {
        match self {
            Self::NotMember => {
                ApiError::forbidden("NOT_A_MEMBER", "You are not a member of this project")
            }
            Self::Revoked => ApiError::forbidden(
                "ACCESS_REVOKED",
                "Your access to this project has been revoked",
            )
            .with_hint("Contact the project admin"),
            Self::InsufficientRole => ApiError::forbidden(
                "ADMIN_REQUIRED",
                "Only project admins can perform this action",
            ),
            Self::ProjectNotFound => ApiError::not_found("PROJECT_NOT_FOUND", "Project not found")
                .with_hint("Check the project name or your permissions"),
            Self::UserNotFound => ApiError::not_found("USER_NOT_FOUND", "User not found"),
        }
    }
}

/// Check that `user_id` is an active member of `project_id` holding at least
/// `required` role. Returns the membership row so callers can reuse it.
pub async fn require_member(
    pool: &SqlitePool,
    project_id: Uuid,
    user_id: Uuid,
    required: Role,
) -> Result<Membership> {
    let membership: Option<Membership> = sqlx::query_as(
        r#"
        SELECT project_id, user_id, role, is_revoked, created_at
        FROM   project_members
        WHERE  project_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some(membership) = membership else {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM projects WHERE id = ?1")
            .bind(project_id)
            .fetch_optional(pool)
            .await?;
        let reason = if exists.is_some() {
            Denied::NotMember
        } else {
            Denied::ProjectNotFound
        };
        return Err(reason.into_error());
    };

    if membership.is_revoked {
        return Err(Denied::Revoked.into_error());
    }
    if required == Role::Admin && membership.role != Role::Admin {
        return Err(Denied::InsufficientRole.into_error());
    }
    Ok(membership)
}

/// Resolve a user id to its row, or `UserNotFound`.
pub async fn require_user(pool: &SqlitePool, user_id: Uuid) -> Result<User> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    user.ok_or_else(|| Denied::UserNotFound.into_error())
}
