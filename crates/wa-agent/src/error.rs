use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse provider response: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("no usable api key available for this provider")]
    KeyPoolExhausted,

    #[error("store error: {0}")]
    Store(#[from] wa_store::Error),

    #[error("user resolution error: {0}")]
    User(#[from] wa_users::UserError),

    #[error("send failed: {0}")]
    Send(#[from] wa_providers::error::ProviderError),

    #[error("scheduler store error: {0}")]
    Scheduler(#[from] wa_scheduler::SchedulerError),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
