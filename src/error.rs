//! Crate-level error for the outer surfaces.
//!
//! Each guard keeps its own error enum; [`GuardError`] wraps them so the
//! management API and the binaries can map any rejection to one response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::{AuthError, AuthErrorKind};
use crate::config::loader::ConfigError;
use crate::exec::{CommandError, CommandErrorKind};
use crate::fs::{PathError, PathErrorKind};
use crate::resilience::{GovernorError, GovernorErrorKind};
use crate::security::{RateLimitExceeded, ResourceError};

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A governor rejection, or the governed call's own failure rendered as text.
    #[error("{message}")]
    Operation {
        kind: GovernorErrorKind,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl<E: std::fmt::Display> From<GovernorError<E>> for GuardError {
    fn from(error: GovernorError<E>) -> Self {
        Self::Operation {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl GuardError {
    /// Machine-readable kind for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(e) => e.kind().as_str(),
            Self::Path(e) => e.kind().as_str(),
            Self::Auth(e) => e.kind().as_str(),
            Self::RateLimited(e) => e.kind(),
            Self::Resource(e) => e.kind().as_str(),
            Self::Operation { kind, .. } => match kind {
                GovernorErrorKind::LimitExceeded => "limit_exceeded",
                GovernorErrorKind::CircuitOpen => "circuit_open",
                GovernorErrorKind::Timeout => "operation_timeout",
                GovernorErrorKind::Failed => "operation_failed",
            },
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(e) => match e.kind() {
                AuthErrorKind::Authentication | AuthErrorKind::Expired => StatusCode::UNAUTHORIZED,
                AuthErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            },
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Resource(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Operation { kind, .. } => match kind {
                GovernorErrorKind::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
                GovernorErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
                GovernorErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                GovernorErrorKind::Failed => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Command(e) => match e.kind() {
                CommandErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                CommandErrorKind::Spawn | CommandErrorKind::NonZeroExit => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::BAD_REQUEST,
            },
            Self::Path(e) => match e.kind() {
                PathErrorKind::NotFound => StatusCode::NOT_FOUND,
                PathErrorKind::AtomicWrite | PathErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Failure-limiter category, when the error looks like a probe.
    pub fn failure_category(&self) -> Option<&'static str> {
        match self {
            Self::Command(e) => e.failure_category(),
            Self::Path(e) => e.failure_category(),
            Self::Auth(e) if e.kind() != AuthErrorKind::AccessDenied => Some("authentication"),
            _ => None,
        }
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}
