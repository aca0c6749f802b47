//! Authentication errors.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("user not found")]
    UserNotFound,

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Errors caused by the credential itself, as opposed to our own failures.
    pub fn is_credential_error(&self) -> bool {
        !matches!(self, AuthError::Internal(_))
    }
}

/// Body of a failed upgrade. `logout` tells the client to drop its credentials.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub code: String,
    pub logout: bool,
}

/// A rejected upgrade, carrying the cookie to clear.
#[derive(Debug)]
pub struct SessionRejection {
    pub error: AuthError,
    pub cookie_name: String,
}

impl IntoResponse for SessionRejection {
    fn into_response(self) -> Response {
        if !self.error.is_credential_error() {
            return self.error.into_response();
        }
        let clear = format!(
            "{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax",
            self.cookie_name
        );
        let body = Json(AuthErrorResponse {
            error: self.error.to_string(),
            code: "UNAUTHORIZED".to_string(),
            logout: true,
        });
        (StatusCode::UNAUTHORIZED, [(header::SET_COOKIE, clear)], body).into_response()
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, logout) = match &self {
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", false),
            _ => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", true),
        };

        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            logout,
        });

        (status, body).into_response()
    }
}
