//! Project snapshots — deterministic export with an integrity checksum and
//! atomic import under a new project identity.
//!
//! The checksum is SHA-256 over the serde_json serialization of [`Snapshot`].
//! serde_json writes struct fields in declaration order with no whitespace,
//! so the field order below *is* the canonical form; reordering fields is a
//! breaking change to every previously issued checksum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::authz;
use crate::errors::{ApiError, Result};
use crate::models::{b64, RequestMeta, Role};
use crate::services::projects;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub name: String,
    pub prk_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMember {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub wrapped_prk: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvVersion {
    pub env_version_id: Uuid,
    pub env_name: String,
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
    pub created_by: Uuid,
    pub metadata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub members: Vec<SnapshotMember>,
    pub env_versions: Vec<SnapshotEnvVersion>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub project_name: String,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub snapshot: Snapshot,
    pub checksum: String,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub new_project_name: String,
    pub snapshot: Snapshot,
    pub checksum: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub new_project_id: Uuid,
}

/// Lowercase hex SHA-256 over the canonical JSON form.
pub fn checksum(snapshot: &Snapshot) -> Result<String> {
    let bytes = serde_json::to_vec(snapshot)
        .map_err(|e| ApiError::Internal(format!("unencodable snapshot: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Export a project's key graph and ciphertexts. Any active member may
/// export; everything in the snapshot is already opaque to the server.
pub async fn export(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: ExportRequest,
) -> Result<ExportResponse> {
    let user = authz::require_user(pool, user_id).await?;
    let project = projects::resolve_for_member(pool, user_id, &req.project_name).await?;

    if let Err(err) = authz::require_member(pool, project.id, user_id, Role::Member).await {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_SNAPSHOT_EXPORT,
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

    // Sorted by user id so a re-export of an imported project reproduces the
    // member order (and therefore the checksum preimage) regardless of
    // insertion order.
    let members: Vec<(Uuid, Vec<u8>, Vec<u8>, Vec<u8>)> = sqlx::query_as(
        r#"
        SELECT user_id, wrapped_prk, wrap_nonce, wrap_ephemeral_pub
        FROM   wrapped_prks
        WHERE  project_id = ?1
        ORDER  BY user_id ASC
        "#,
    )
    .bind(project.id)
    .fetch_all(pool)
    .await?;

    let env_versions: Vec<SnapshotEnvVersion> = sqlx::query_as::<_, crate::models::EnvVersion>(
        r#"
        SELECT id, project_id, env_name, version, ciphertext, nonce,
               wrapped_dek, dek_nonce, encryption_version, created_at,
               created_by, metadata
        FROM   env_versions
        WHERE  project_id = ?1
        ORDER  BY env_name ASC, version ASC
        "#,
    )
    .bind(project.id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| SnapshotEnvVersion {
        env_version_id: row.id,
        env_name: row.env_name,
        version: row.version,
        ciphertext: row.ciphertext,
        nonce: row.nonce,
        wrapped_dek: row.wrapped_dek,
        dek_nonce: row.dek_nonce,
        encryption_version: row.encryption_version,
        created_at: row.created_at,
        created_by: row.created_by,
        metadata: row.metadata,
    })
    .collect();

    let snapshot = Snapshot {
        metadata: SnapshotMetadata {
            name: project.name,
            prk_version: project.prk_version,
        },
        members: members
            .into_iter()
            .map(|(member_id, wrapped_prk, wrap_nonce, ephemeral_public_key)| SnapshotMember {
                user_id: member_id,
                wrapped_prk,
                wrap_nonce,
                ephemeral_public_key,
            })
            .collect(),
        env_versions,
    };

    let checksum = checksum(&snapshot)?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_SNAPSHOT_EXPORT,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(project.id),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(ExportResponse { snapshot, checksum })
}

/// Import a snapshot as a brand-new project. Env versions get fresh ids but
/// keep their original version numbers, ciphertexts, wraps, timestamps, and
/// creators; the importing user becomes admin, everyone else a member.
pub async fn import(
    pool: &SqlitePool,
    meta: &RequestMeta,
    user_id: Uuid,
    req: ImportRequest,
) -> Result<ImportResponse> {
    let user = authz::require_user(pool, user_id).await?;

    if req.snapshot.members.is_empty() {
        return Err(ApiError::bad_request(
            "SNAPSHOT_EMPTY",
            "Snapshot must contain at least one wrapped PRK member",
        ));
    }

    let mut snapshot = req.snapshot;
    if snapshot.metadata.prk_version < 1 {
        snapshot.metadata.prk_version = 1;
    }

    let actual = checksum(&snapshot)?;
    if actual != req.checksum {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_SNAPSHOT_IMPORT,
            actor_type: audit::ACTOR_USER,
            actor_id: user_id.to_string(),
            actor_email: user.email,
            status: audit::STATUS_FAILURE,
            err_msg: Some("checksum mismatch".to_string()),
            ..Default::default()
        })
        .await;
        return Err(ApiError::bad_request(
            "CHECKSUM_MISMATCH",
            "Snapshot checksum does not match",
        )
        .with_hint("The snapshot data may be corrupted or tampered with"));
    }

    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM projects WHERE name = ?1 AND created_by = ?2")
            .bind(&req.new_project_name)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Err(ApiError::conflict(
            "PROJECT_EXISTS",
            "You already have a project with this name",
        )
        .with_hint("Choose a different project name"));
    }

    // Wrapped material can only be addressed to users this server knows.
    for member in &snapshot.members {
        if authz::require_user(pool, member.user_id).await.is_err() {
            return Err(ApiError::bad_request(
                "SNAPSHOT_UNKNOWN_MEMBER",
                format!("Snapshot member {} is not a user on this server", member.user_id),
            ));
        }
    }

    let new_project_id = Uuid::new_v4();
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO projects (id, name, created_by, prk_version, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(new_project_id)
    .bind(&req.new_project_name)
    .bind(user_id)
    .bind(snapshot.metadata.prk_version)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for member in &snapshot.members {
        let role = if member.user_id == user_id {
            Role::Admin
        } else {
            Role::Member
        };
        sqlx::query(
            "INSERT INTO project_members (project_id, user_id, role, is_revoked, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
        )
        .bind(new_project_id)
        .bind(member.user_id)
        .bind(role.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO wrapped_prks (project_id, user_id, wrapped_prk, wrap_nonce, wrap_ephemeral_pub, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(new_project_id)
        .bind(member.user_id)
        .bind(&member.wrapped_prk)
        .bind(&member.wrap_nonce)
        .bind(&member.ephemeral_public_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    for env in &snapshot.env_versions {
        // Fresh id, original everything else — version contiguity per
        // env_name carries over from the source project.
        sqlx::query(
            r#"
            INSERT INTO env_versions
                (id, project_id, env_name, version, ciphertext, nonce,
                 wrapped_dek, dek_nonce, encryption_version, created_at,
                 created_by, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_project_id)
        .bind(&env.env_name)
        .bind(env.version)
        .bind(&env.ciphertext)
        .bind(&env.nonce)
        .bind(&env.wrapped_dek)
        .bind(&env.dek_nonce)
        .bind(env.encryption_version)
        .bind(env.created_at)
        .bind(env.created_by)
        .bind(&env.metadata)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_SNAPSHOT_IMPORT,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: user.email,
        project_id: Some(new_project_id),
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(ImportResponse {
        new_project_id,
    })
}
