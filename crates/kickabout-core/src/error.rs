//! Error taxonomy for the data-access layer.
//!
//! Every failure a fetch can hit maps onto one closed set of variants,
//! produced in exactly two places: `FetchError::from_status` for HTTP
//! responses and the `From<reqwest::Error>` impl for transport failures.
//! The retry policy and the session controller branch on these variants
//! rather than inspecting error strings.

use thiserror::Error;

/// Maximum length for error response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Failure modes of a network fetch.
///
/// Variants own their message strings (no wrapped `reqwest::Error`) so a
/// result can be cloned out of a shared in-flight future to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("authentication expired")]
    AuthExpired,

    #[error("invalid data: {0}")]
    Parse(String),
}

impl FetchError {
    /// Whether a retry could plausibly succeed. Client-side rejections and
    /// malformed payloads will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout | FetchError::Server { .. }
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate_body(body);
        match status {
            401 => FetchError::AuthExpired,
            400..=499 => FetchError::Client { status, message },
            500..=599 => FetchError::Server { status, message },
            _ => FetchError::Parse(format!("unexpected status {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Truncate a response body to avoid carrying excessive data in errors
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        format!(
            "{}... (truncated, {} total bytes)",
            &body[..MAX_ERROR_BODY_LENGTH],
            body.len()
        )
    }
}

/// Failures of the shared storage backends.
///
/// Callers above the raw backends (TokenStore, SessionController) absorb
/// these: a failed location is logged and treated as missing.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
