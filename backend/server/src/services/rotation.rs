//! Two-phase PRK rotation.
//!
//! Init hands the rotating client the whole key graph; the client generates
//! a new PRK, re-wraps it for every member, re-wraps every DEK, and submits
//! a commit. Commit is linearized per project by a compare-and-set on
//! `prk_version` and applied atomically: after it either every wrapped blob
//! reflects the new PRK or none do.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::authz;
use crate::errors::{ApiError, Result};
use crate::models::{b64, Project, RequestMeta, Role};

#[derive(Debug, Deserialize)]
pub struct RotateInitRequest {
    pub project_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPublicKey {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKeyEntry {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WrappedDekEntry {
    pub env_version_id: Uuid,
    #[serde(with = "b64")]
    pub wrapped_dek: Vec<u8>,
    #[serde(with = "b64")]
    pub dek_nonce: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewWrappedDek {
    pub env_version_id: Uuid,
    #[serde(with = "b64")]
    pub new_wrapped_dek: Vec<u8>,
    #[serde(with = "b64")]
    pub new_dek_nonce: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct RotateInitResponse {
    pub prk_version: i64,
    pub member_public_keys: Vec<MemberPublicKey>,
    pub wrapped_prks: Vec<WrappedKeyEntry>,
    pub wrapped_deks: Vec<WrappedDekEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RotateCommitRequest {
    pub project_id: Uuid,
    pub expected_prk_version: i64,
    pub new_wrapped_prks: Vec<WrappedKeyEntry>,
    pub new_wrapped_deks: Vec<NewWrappedDek>,
}

#[derive(Debug, Serialize)]
pub struct RotateCommitResponse {
    pub new_prk_version: i64,
}

/// Phase 1: snapshot the key graph so the client can rebuild it under a new
/// PRK. Any active member may rotate.
pub async fn init(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: RotateInitRequest,
) -> Result<RotateInitResponse> {
    let user = authz::require_user(pool, user_id).await?;
    authz::require_member(pool, req.project_id, user_id, Role::Member).await?;

    let project: Project = sqlx::query_as(
        "SELECT id, name, created_by, prk_version, created_at FROM projects WHERE id = ?1",
    )
    .bind(req.project_id)
    .fetch_one(pool)
    .await?;

    // The wrap set joined with each member's public key: the rotating client
    // must re-encrypt to every one of them.
    let rows: Vec<(Uuid, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> = sqlx::query_as(
        r#"
        SELECT w.user_id, w.wrapped_prk, w.wrap_nonce, w.wrap_ephemeral_pub, u.public_key
        FROM   wrapped_prks w
        JOIN   users u ON u.id = w.user_id
        WHERE  w.project_id = ?1
        ORDER  BY w.user_id ASC
        "#,
    )
    .bind(req.project_id)
    .fetch_all(pool)
    .await?;

    let mut member_public_keys = Vec::with_capacity(rows.len());
    let mut wrapped_prks = Vec::with_capacity(rows.len());
    for (member_id, wrapped_prk, wrap_nonce, ephemeral_public_key, public_key) in rows {
        member_public_keys.push(MemberPublicKey {
            user_id: member_id,
            public_key,
        });
        wrapped_prks.push(WrappedKeyEntry {
            user_id: member_id,
            wrapped_prk,
            wrap_nonce,
            ephemeral_public_key,
        });
    }

    let deks: Vec<(Uuid, Vec<u8>, Vec<u8>)> = sqlx::query_as(
        "SELECT id, wrapped_dek, dek_nonce FROM env_versions WHERE project_id = ?1 ORDER BY env_name ASC, version ASC",
    )
    .bind(req.project_id)
    .fetch_all(pool)
    .await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_PRK_ROTATE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(req.project_id),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({ "phase": "init" })),
        ..Default::default()
    })
    .await;

    Ok(RotateInitResponse {
        prk_version: project.prk_version,
        member_public_keys,
        wrapped_prks,
        wrapped_deks: deks
            .into_iter()
            .map(|(env_version_id, wrapped_dek, dek_nonce)| WrappedDekEntry {
                env_version_id,
                wrapped_dek,
                dek_nonce,
            })
            .collect(),
    })
}

/// Phase 2: apply the rebuilt key graph. The CAS on `prk_version` rejects a
/// racing rotation; the completeness checks reject a wrap set that no longer
/// covers every member or every env version.
pub async fn commit(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: RotateCommitRequest,
) -> Result<RotateCommitResponse> {
    let user = authz::require_user(pool, user_id).await?;
    authz::require_member(pool, req.project_id, user_id, Role::Member).await?;

    let fail_audit = |err_msg: String| AuditEntry {
        action: audit::ACTION_PRK_ROTATE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email.clone(),
        project_id: Some(req.project_id),
        status: audit::STATUS_FAILURE,
        err_msg: Some(err_msg),
        metadata: Some(serde_json::json!({ "phase": "commit" })),
        ..Default::default()
    };

    let mut tx = pool.begin().await?;

    let bumped: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE projects
        SET    prk_version = prk_version + 1
        WHERE  id = ?1 AND prk_version = ?2
        RETURNING prk_version
        "#,
    )
    .bind(req.project_id)
    .bind(req.expected_prk_version)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((new_prk_version,)) = bumped else {
        drop(tx);
        audit::log(pool, meta, fail_audit("prk version conflict".to_string())).await;
        return Err(ApiError::conflict(
            "VERSION_CONFLICT",
            "Another rotation committed first",
        )
        .with_hint("Re-run rotation init and rebuild the wrap set"));
    };

    // Completeness: one new wrapped PRK per current member, no extras.
    let member_rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM wrapped_prks WHERE project_id = ?1")
            .bind(req.project_id)
            .fetch_all(&mut *tx)
            .await?;
    let expected_members: HashSet<Uuid> = member_rows.into_iter().map(|(id,)| id).collect();
    let supplied_members: HashSet<Uuid> =
        req.new_wrapped_prks.iter().map(|w| w.user_id).collect();
    if supplied_members != expected_members
        || req.new_wrapped_prks.len() != expected_members.len()
    {
        drop(tx);
        audit::log(pool, meta, fail_audit("incomplete member rewrap".to_string())).await;
        return Err(ApiError::conflict(
            "INCOMPLETE_REWRAP",
            "Commit must supply exactly one new wrapped PRK per current member",
        )
        .with_hint("Re-run rotation init and rebuild the wrap set"));
    }

    // Completeness: one new DEK per env version currently in the project.
    let env_rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT id FROM env_versions WHERE project_id = ?1")
            .bind(req.project_id)
            .fetch_all(&mut *tx)
            .await?;
    let expected_envs: HashSet<Uuid> = env_rows.into_iter().map(|(id,)| id).collect();
    let supplied_envs: HashSet<Uuid> =
        req.new_wrapped_deks.iter().map(|d| d.env_version_id).collect();
    if supplied_envs != expected_envs || req.new_wrapped_deks.len() != expected_envs.len() {
        drop(tx);
        audit::log(pool, meta, fail_audit("incomplete dek rewrap".to_string())).await;
        return Err(ApiError::conflict(
            "INCOMPLETE_REWRAP",
            "Commit must supply exactly one new wrapped DEK per env version",
        )
        .with_hint("Re-run rotation init and rebuild the wrap set"));
    }

    for wrap in &req.new_wrapped_prks {
        let updated = sqlx::query(
            r#"
            UPDATE wrapped_prks
            SET    wrapped_prk = ?1, wrap_nonce = ?2, wrap_ephemeral_pub = ?3
            WHERE  project_id = ?4 AND user_id = ?5
            "#,
        )
        .bind(&wrap.wrapped_prk)
        .bind(&wrap.wrap_nonce)
        .bind(&wrap.ephemeral_public_key)
        .bind(req.project_id)
        .bind(wrap.user_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(ApiError::Internal(
                "wrapped PRK vanished mid-commit".to_string(),
            ));
        }
    }

    for dek in &req.new_wrapped_deks {
        // The project filter keeps a stray env-version id from touching
        // another tenant's rows.
        let updated = sqlx::query(
            "UPDATE env_versions SET wrapped_dek = ?1, dek_nonce = ?2 WHERE id = ?3 AND project_id = ?4",
        )
        .bind(&dek.new_wrapped_dek)
        .bind(&dek.new_dek_nonce)
        .bind(dek.env_version_id)
        .bind(req.project_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(ApiError::Internal(
                "env version vanished mid-commit".to_string(),
            ));
        }
    }

    tx.commit().await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_PRK_ROTATE,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(req.project_id),
        status: audit::STATUS_SUCCESS,
        metadata: Some(serde_json::json!({
            "phase": "commit",
            "new_prk_version": new_prk_version,
        })),
        ..Default::default()
    })
    .await;

    Ok(RotateCommitResponse { new_prk_version })
}
