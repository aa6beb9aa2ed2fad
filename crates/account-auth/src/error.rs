//! Error types for login operations

/// Errors from an authentication attempt.
///
/// The pool converts every variant into a persisted `error_msg` and a `false`
/// login result; none of them reach the pool's callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("multi-factor challenge not satisfied: {0}")]
    MfaRequired(String),

    #[error("account blocked by service: {0}")]
    Blocked(String),

    #[error("session parse error: {0}")]
    SessionParse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
