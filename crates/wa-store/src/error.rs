use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `true` if the underlying SQLite error is a UNIQUE constraint violation —
/// the shape the summary/dedup "peer already inserted it" race relies on.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
