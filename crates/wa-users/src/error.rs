use thiserror::Error;

/// Kept separate from `wa_core::Error` so the gateway can distinguish
/// resolution failures from the rest of the pipeline's errors.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] wa_store::Error),
}

pub type Result<T> = std::result::Result<T, UserError>;
