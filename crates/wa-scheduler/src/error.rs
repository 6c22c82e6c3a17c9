use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("scheduler lease not held")]
    LeaseNotHeld,

    #[error("store error: {0}")]
    Store(String),

    #[error("conflicting appointment in [{start}, {end})")]
    AppointmentConflict { start: String, end: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
