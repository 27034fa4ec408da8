//! Application-wide error types.
//!
//! Every service operation returns [`ApiError`]. Errors carry a machine code
//! alongside the human message; the axum layer renders them as
//! `{"error": {"code", "message", "hint"?, "fields"?}}` with the matching
//! HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// A single field-scoped validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest {
        code: &'static str,
        message: String,
        hint: Option<String>,
    },

    #[error("validation failed")]
    Validation { fields: Vec<FieldError> },

    #[error("{message}")]
    Unauthorized { code: &'static str, message: String },

    #[error("{message}")]
    Forbidden {
        code: &'static str,
        message: String,
        hint: Option<String>,
    },

    #[error("{message}")]
    NotFound {
        code: &'static str,
        message: String,
        hint: Option<String>,
    },

    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: String,
        hint: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn validation(fields: Vec<FieldError>) -> Self {
        Self::Validation { fields }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a client-facing hint. No-op on variants that don't carry one.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        match &mut self {
            Self::BadRequest { hint: h, .. }
            | Self::Forbidden { hint: h, .. }
            | Self::NotFound { hint: h, .. }
            | Self::Conflict { hint: h, .. } => *h = Some(hint.into()),
            _ => {}
        }
        self
    }

    /// Stable machine code for clients and the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::Forbidden { code, .. }
            | Self::NotFound { code, .. }
            | Self::Conflict { code, .. } => code,
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::Config(_) | Self::Database(_) | Self::Migrate(_) | Self::Internal(_) => {
                "INTERNAL"
            }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Config(_) | Self::Database(_) | Self::Migrate(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details go to the log, not the wire.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut error = json!({ "code": self.code(), "message": message });
        match &self {
            Self::BadRequest { hint: Some(h), .. }
            | Self::Forbidden { hint: Some(h), .. }
            | Self::NotFound { hint: Some(h), .. }
            | Self::Conflict { hint: Some(h), .. } => {
                error["hint"] = json!(h);
            }
            Self::Validation { fields } => {
                error["fields"] = json!(fields);
            }
            _ => {}
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let err = ApiError::not_found("PROJECT_NOT_FOUND", "Project not found");
        assert_eq!(err.code(), "PROJECT_NOT_FOUND");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = ApiError::conflict("VERSION_CONFLICT", "raced");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = ApiError::Internal("boom".into());
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn hint_attaches_only_where_supported() {
        let err = ApiError::forbidden("ADMIN_REQUIRED", "nope").with_hint("ask an admin");
        match err {
            ApiError::Forbidden { hint, .. } => assert_eq!(hint.as_deref(), Some("ask an admin")),
            _ => panic!("expected Forbidden"),
        }

        let err = ApiError::unauthorized("SESSION_EXPIRED", "expired").with_hint("ignored");
        match err {
            ApiError::Unauthorized { .. } => {}
            _ => panic!("expected Unauthorized"),
        }
    }
}
