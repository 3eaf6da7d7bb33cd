//! Unified application error model and mapping helpers.
//! `GateError` is the identity/access failure taxonomy; `AppError` is the wire-facing
//! shape (code + message + HTTP status) of transport-level failures.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Failures raised while establishing who a caller is and what they may touch.
#[derive(Debug, Error)]
pub enum GateError {
    /// Username without password while proxy auth is disabled.
    #[error("user and password must be set")]
    AuthRequired,

    #[error("invalid auth value with empty username and password")]
    InvalidCredentials,

    /// The proxy flow only exists for bearer/forwarded identities.
    #[error("proxy auth is not supported with basic auth")]
    ProxyAuthUnsupportedScheme,

    #[error("invalid backend account: {0}")]
    InvalidAccountConfig(String),

    #[error("authorization header is missing or is not a bearer token")]
    BearerTokenMissing,

    #[error("failed to introspect token: {0}")]
    IntrospectionFailed(String),

    #[error("invalid or expired access token")]
    TokenInactive,

    #[error("failed to get userinfo for token: {0}")]
    UserinfoFailed(String),

    #[error("{operation:?} request is not permitted for path {path:?}")]
    AccessDenied { operation: String, path: String },

    #[error("failed to open backend session for user {user:?}: {reason}")]
    BackendSessionUnavailable { user: String, reason: String },

    #[error("anonymous user is not allowed to run {operation:?}")]
    AnonymousNotAllowed { operation: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to run {operation:?}: {reason}")]
    OperationFailed { operation: String, reason: String },
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::AuthRequired => "auth_required",
            GateError::InvalidCredentials => "invalid_credentials",
            GateError::ProxyAuthUnsupportedScheme => "proxy_auth_unsupported_scheme",
            GateError::InvalidAccountConfig(_) => "invalid_account_config",
            GateError::BearerTokenMissing => "bearer_token_missing",
            GateError::IntrospectionFailed(_) => "introspection_failed",
            GateError::TokenInactive => "token_inactive",
            GateError::UserinfoFailed(_) => "userinfo_failed",
            GateError::AccessDenied { .. } => "access_denied",
            GateError::BackendSessionUnavailable { .. } => "backend_session_unavailable",
            GateError::AnonymousNotAllowed { .. } => "anonymous_not_allowed",
            GateError::InvalidArgument(_) => "invalid_argument",
            GateError::OperationFailed { .. } => "operation_failed",
        }
    }
}

/// Transport-level failures: malformed requests, failed upstream fetches, crashed tasks.
/// Tool failures never take this path; they are `ToolResult` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. } | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. } | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn internal(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::Internal { .. } => 500,
        }
    }

    /// JSON body used by both transports.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({"status": "error", "code": self.code_str(), "error": self.message()})
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal".into(), message: format!("{:#}", err) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_request", "oops").http_status(), 400);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn anyhow_maps_to_internal_with_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("failed to get authorization server metadata");
        let app = AppError::from(err);
        assert_eq!(app.http_status(), 500);
        assert_eq!(app.message(), "failed to get authorization server metadata: connection refused");
        assert_eq!(app.to_json()["code"], "internal");
    }

    #[test]
    fn access_denied_names_operation_and_path() {
        let e = GateError::AccessDenied { operation: "irods_read_file".into(), path: "/z/home/bob/x".into() };
        assert_eq!(e.to_string(), r#""irods_read_file" request is not permitted for path "/z/home/bob/x""#);
        assert_eq!(e.code(), "access_denied");
    }
}
