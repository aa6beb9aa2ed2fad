//! Error types for pool operations

use rusqlite::ErrorCode;

/// Errors from pool and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("no account available for queue {0}")]
    NoAccount(String),

    #[error("store still locked after {attempts} attempts: {source}")]
    StoreLocked {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("SQLite {found} is too old, {required} or newer is required")]
    EngineTooOld { found: String, required: String },

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("import error: {0}")]
    Import(String),

    #[error("store task failed: {0}")]
    Task(String),
}

impl Error {
    /// Whether this is contention on the store file held by another writer.
    ///
    /// Decided by the SQLite result code, never by message text.
    pub fn is_transient_lock(&self) -> bool {
        match self {
            Error::Sqlite(e) => is_busy(e),
            _ => false,
        }
    }
}

/// `SQLITE_BUSY` / `SQLITE_LOCKED` check on a raw driver error.
pub(crate) fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
