//! Error types for the BFF gateway

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the BFF gateway
pub type Result<T> = std::result::Result<T, Error>;

/// BFF gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The flow needs the caller's bearer credential but the request carried none
    #[error("Missing subject token: {0}")]
    MissingSubjectToken(String),

    /// The identity provider rejected or garbled a grant request
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    /// The client assertion could not be built
    #[error("Signing error: {0}")]
    Signing(String),

    /// The request path would leave the route's upstream base path
    #[error("Invalid request path: {0}")]
    InvalidPath(String),

    /// The forwarded request never reached the upstream origin
    #[error("Upstream unreachable: {0}")]
    ProxyUpstreamUnreachable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to the caller when this error ends a request
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSubjectToken(_) | Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::ProxyUpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::Signing(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs
        let message = match &self {
            Self::MissingSubjectToken(_)
            | Self::InvalidPath(_)
            | Self::ProxyUpstreamUnreachable(_) => self.to_string(),
            _ => "Internal server error".to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_subject_token_is_a_client_error() {
        let err = Error::MissingSubjectToken("token exchange for scope api://x".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unreachable_upstream_is_a_gateway_error() {
        let err = Error::ProxyUpstreamUnreachable("http://nom-api".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn other_errors_map_to_internal() {
        assert_eq!(
            Error::Exchange("HTTP 500".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::Config("missing client id".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn into_response_hides_internal_details() {
        let response = Error::Signing("bad key material".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
