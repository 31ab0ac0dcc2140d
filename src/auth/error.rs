use crate::store::StorageError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OAuth 2.0 error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized_client")]
    UnauthorizedClient,
    #[error("invalid_request: redirect_uri mismatch")]
    RedirectUriMismatch,
    #[error("invalid_client")]
    InvalidClient,
    #[error("invalid_grant")]
    InvalidGrant,
    #[error("invalid_scope")]
    InvalidScope,
    #[error("access_denied")]
    AccessDenied,
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
    #[error("unsupported_response_type")]
    UnsupportedResponseType,
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl OAuthError {
    /// the `error` code on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::RedirectUriMismatch => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::Storage(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Client-facing text. Internal causes never leave the server.
    pub fn description(&self) -> String {
        match self {
            Self::InvalidRequest(msg) => msg.clone(),
            Self::UnauthorizedClient => "Unknown client".to_string(),
            Self::RedirectUriMismatch => "redirect_uri does not match the registered value".to_string(),
            Self::InvalidClient => "Client authentication failed".to_string(),
            Self::InvalidGrant => "Invalid, expired or already used grant".to_string(),
            Self::InvalidScope => "Requested scope exceeds the original grant".to_string(),
            Self::AccessDenied => "Invalid resource owner credentials".to_string(),
            Self::UnsupportedGrantType => "Unsupported grant_type".to_string(),
            Self::UnsupportedResponseType => "Unsupported response_type".to_string(),
            Self::Storage(_) | Self::Internal(_) => "The server encountered an internal error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClient | Self::AccessDenied => StatusCode::UNAUTHORIZED,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        match &self {
            Self::Storage(e) => tracing::error!("token store failure: {}", e),
            Self::Internal(e) => tracing::error!("internal failure: {}", e),
            other => tracing::debug!("oauth error response: {}", other),
        }

        let body = ErrorResponse {
            error: self.code().to_string(),
            error_description: Some(self.description()),
        };
        (self.status(), Json(body)).into_response()
    }
}
