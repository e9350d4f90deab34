//! Metadata store error types.

use thiserror::Error;

use crate::quota::QuotaError;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The record is missing or belongs to another user. Callers never learn which.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Maps a unique-constraint failure to `AlreadyExists`, everything else to `Database`.
pub(crate) fn map_unique(err: sqlx::Error, what: impl Into<String>) -> MetadataError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            MetadataError::AlreadyExists(what.into())
        }
        other => MetadataError::Database(other),
    }
}

/// A foreign-key failure on a child row means the parent was deleted underneath us.
pub(crate) fn map_missing_parent(err: sqlx::Error, parent: &'static str) -> MetadataError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
            MetadataError::NotFound(parent)
        }
        other => MetadataError::Database(other),
    }
}
