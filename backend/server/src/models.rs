//! Domain records as stored in / read from the database, plus the small
//! shared types every layer touches.
//!
//! All key material and ciphertext is opaque to the server: blobs go in and
//! out unmodified. On the wire they are base64 strings (see [`b64`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serde adapter encoding binary blobs as standard base64 strings in JSON.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Per-request details captured by middleware and passed explicitly into
/// every service operation; consumed by the audit trail.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Membership role within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub password_salt: Vec<u8>,
    pub password_params: String,
    pub public_key: Vec<u8>,
    pub enc_private_key: Vec<u8>,
    pub enc_private_key_salt: Vec<u8>,
    pub enc_private_key_nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    pub prk_version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Membership {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub is_revoked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WrappedPrk {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub wrapped_prk: Vec<u8>,
    pub wrap_nonce: Vec<u8>,
    pub wrap_ephemeral_pub: Vec<u8>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvVersion {
    pub id: Uuid,
    pub project_id: Uuid,
    pub env_name: String,
    pub version: i64,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub wrapped_dek: Vec<u8>,
    pub dek_nonce: Vec<u8>,
    pub encryption_version: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: Uuid,
    pub metadata: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceRole {
    pub id: Uuid,
    pub name: String,
    pub public_key: Vec<u8>,
    pub repo_principal: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Delegation {
    pub service_role_id: Uuid,
    pub project_id: Uuid,
    pub env: String,
    pub wrapped_prk: Vec<u8>,
    pub wrap_nonce: Vec<u8>,
    pub wrap_ephemeral_pub: Vec<u8>,
    pub delegated_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CiSession {
    pub id: Uuid,
    pub service_role_id: Uuid,
    pub project_id: Uuid,
    pub env: String,
    pub repo_principal: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable audit row. `metadata` holds free-form JSON text.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub request_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub actor_email: String,
    pub action: String,
    pub project_id: Option<Uuid>,
    pub environment: Option<String>,
    pub target_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
}
