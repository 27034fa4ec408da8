//! User registration, login, and public-key lookup.
//!
//! The server stores the user's public key and a client-encrypted private
//! key bundle; it can never unwrap the latter.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::auth;
use crate::db::is_unique_violation;
use crate::errors::{ApiError, FieldError, Result};
use crate::models::{b64, RequestMeta, User};
use crate::services::sessions::{self, AuthTokens};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub enc_private_key: Vec<u8>,
    #[serde(with = "b64")]
    pub enc_private_key_salt: Vec<u8>,
    #[serde(with = "b64")]
    pub enc_private_key_nonce: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PublicKeyRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

pub async fn register(
    pool: &SqlitePool,
    meta: &RequestMeta,
    req: RegisterRequest,
) -> Result<AuthTokens> {
    let mut fields = Vec::new();
    if !req.email.contains('@') {
        fields.push(FieldError {
            field: "email",
            message: "must be a valid email address".to_string(),
        });
    }
    if req.password.len() < 8 {
        fields.push(FieldError {
            field: "password",
            message: "must be at least 8 characters".to_string(),
        });
    }
    if req.public_key.is_empty() {
        fields.push(FieldError {
            field: "public_key",
            message: "must not be empty".to_string(),
        });
    }
    if !fields.is_empty() {
        return Err(ApiError::validation(fields));
    }

    let hashed = auth::hash_password(&req.password)?;
    let params_json = serde_json::to_string(&hashed.params)
        .map_err(|e| ApiError::Internal(format!("unencodable KDF parameters: {e}")))?;

    let user_id = Uuid::new_v4();
    let inserted = sqlx::query(
        r#"
        INSERT INTO users
            (id, email, password_hash, password_salt, password_params,
             public_key, enc_private_key, enc_private_key_salt,
             enc_private_key_nonce, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(user_id)
    .bind(&req.email)
    .bind(&hashed.hash)
    .bind(&hashed.salt)
    .bind(&params_json)
    .bind(&req.public_key)
    .bind(&req.enc_private_key)
    .bind(&req.enc_private_key_salt)
    .bind(&req.enc_private_key_nonce)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            audit::log(pool, meta, AuditEntry {
                action: audit::ACTION_REGISTER,
                actor_type: audit::ACTOR_USER,
                actor_email: req.email.clone(),
                status: audit::STATUS_FAILURE,
                err_msg: Some("email already registered".to_string()),
                ..Default::default()
            })
            .await;
            return Err(ApiError::conflict(
                "EMAIL_TAKEN",
                "An account with this email already exists",
            ));
        }
        return Err(err.into());
    }

    let tokens = sessions::issue_tokens(pool, user_id).await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_REGISTER,
        actor_type: audit::ACTOR_USER,
        actor_id: user_id.to_string(),
        actor_email: req.email,
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(tokens)
}

pub async fn login(pool: &SqlitePool, meta: &RequestMeta, req: LoginRequest) -> Result<AuthTokens> {
    // One error for both unknown email and bad password, so login does not
    // reveal which emails exist.
    let invalid =
        || ApiError::unauthorized("INVALID_CREDENTIALS", "Invalid email or password");

    let Some(user) = get_by_email(pool, &req.email).await? else {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_LOGIN,
            actor_type: audit::ACTOR_USER,
            actor_email: req.email,
            status: audit::STATUS_FAILURE,
            err_msg: Some("unknown email".to_string()),
            ..Default::default()
        })
        .await;
        return Err(invalid());
    };

    let params: auth::KdfParams = serde_json::from_str(&user.password_params)
        .map_err(|e| ApiError::Internal(format!("corrupt stored KDF parameters: {e}")))?;

    if !auth::verify_password(&req.password, &user.password_hash, &user.password_salt, &params)? {
        audit::log(pool, meta, AuditEntry {
            action: audit::ACTION_LOGIN,
            actor_type: audit::ACTOR_USER,
            actor_id: user.id.to_string(),
            actor_email: user.email,
            status: audit::STATUS_FAILURE,
            err_msg: Some("wrong password".to_string()),
            ..Default::default()
        })
        .await;
        return Err(invalid());
    }

    let tokens = sessions::issue_tokens(pool, user.id).await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_LOGIN,
        actor_type: audit::ACTOR_USER,
        actor_id: user.id.to_string(),
        actor_email: user.email,
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(tokens)
}

/// Delete every access and refresh token the user holds.
pub async fn logout(pool: &SqlitePool, meta: &RequestMeta, user_id: Uuid) -> Result<()> {
    let user = crate::authz::require_user(pool, user_id).await?;

    sqlx::query("DELETE FROM user_sessions WHERE user_id = ?1")
        .bind(user_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?1")
        .bind(user_id)
        .execute(pool)
        .await?;

    audit::log(pool, meta, AuditEntry {
        action: audit::ACTION_LOGOUT,
        actor_type: audit::ACTOR_USER,
        actor_id: user.id.to_string(),
        actor_email: user.email,
        status: audit::STATUS_SUCCESS,
        ..Default::default()
    })
    .await;

    Ok(())
}

/// Look up another user's public key by email — admins need it to wrap a
/// PRK for a new member. Only the public half is ever returned.
pub async fn search_public_key(
    pool: &SqlitePool,
    req: PublicKeyRequest,
) -> Result<PublicKeyResponse> {
    let user = get_by_email(pool, &req.email)
        .await?
        .ok_or_else(|| ApiError::not_found("USER_NOT_FOUND", "User not found"))?;

    Ok(PublicKeyResponse {
        user_id: user.id,
        public_key: user.public_key,
    })
}

pub(crate) async fn get_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?1")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}
