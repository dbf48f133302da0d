//! Error types for the sign-in bridge.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generic text returned to the browser for every rejected sign-in.
pub const NOT_AUTHORIZED: &str = "Not authorized.";

/// Startup configuration errors. These are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} not configured")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Authorization code exchange errors.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Token request failed: {0}")]
    Transport(String),

    #[error("Token request timed out")]
    Timeout,

    #[error("Token endpoint returned HTTP {status} ({code})")]
    Provider { status: u16, code: String },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Token response has no id_token")]
    MissingIdToken,

    #[error("Invalid id_token: {0}")]
    InvalidIdToken(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Local user directory errors.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("User directory unavailable: {0}")]
    Unavailable(String),
}

/// Sign-in errors. Every variant maps to the same 403 response.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Code exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Identity provider returned an error: {0}")]
    ProviderDenied(String),

    #[error("Callback is missing the authorization code")]
    MissingCode,

    #[error("Malformed callback: {0}")]
    MalformedCallback(String),

    #[error("Token claims have no preferred_username")]
    MissingClaim,

    #[error("Email domain not allowed: {0}")]
    DomainRejected(String),

    #[error("No active local account for {0}")]
    AccountNotFound(String),
}

impl AuthError {
    /// Returns the message shown to the user. Deliberately identical for every cause.
    pub fn user_message(&self) -> &'static str {
        NOT_AUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            Self::Exchange(_) => tracing::error!(error = %self, "Unable to authenticate user"),
            _ => tracing::warn!(error = %self, "Unable to authenticate user"),
        }
        (StatusCode::FORBIDDEN, self.user_message()).into_response()
    }
}
