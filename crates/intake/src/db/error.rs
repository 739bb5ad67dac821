//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value could not be turned back into its domain type.
    #[error("Failed to decode column '{column}': {reason}")]
    Decode { column: &'static str, reason: String },

    /// A write hit a UNIQUE index.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl DatabaseError {
    /// Maps SQLite UNIQUE failures to `UniqueViolation`, leaving other
    /// errors untouched.
    pub(crate) fn from_write(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                DatabaseError::UniqueViolation(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => DatabaseError::Sqlite(err),
        }
    }
}
