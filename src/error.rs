//! Error types for the API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced to API clients.
///
/// Client mistakes map to 400/401; orchestrator failures during `/up` and
/// `/ping` are surfaced as 400 with the underlying message. The reconciler
/// never produces these - it logs and relies on convergence.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No session or access token on a protected endpoint.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The auth provider rejected the callback or token.
    #[error("Error authenticating user")]
    AuthFailed,

    /// The claim token does not match any claimed or running slot.
    #[error("Invalid claim token")]
    InvalidClaim,

    /// The `(repo, branch)` pair is not on the configured whitelist.
    #[error("Invalid repo")]
    RepoNotAllowed,

    /// Malformed request body.
    #[error("{0}")]
    BadRequest(String),

    /// An orchestrator or repo-fetch call failed while serving the request.
    #[error("{0}")]
    Upstream(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Upstream(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAuthenticated | Self::InvalidClaim | Self::RepoNotAllowed => {
                StatusCode::UNAUTHORIZED
            }
            Self::AuthFailed | Self::BadRequest(_) | Self::Upstream(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
