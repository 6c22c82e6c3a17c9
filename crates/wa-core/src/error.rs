use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("agent not found: {id}")]
    AgentNotFound { id: i64 },

    #[error("conversation not found: {id}")]
    ConversationNotFound { id: i64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short error code, mirrors the pattern used for operator-facing diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            Error::ConversationNotFound { .. } => "CONVERSATION_NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
