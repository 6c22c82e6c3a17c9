use thiserror::Error;

/// Errors surfaced by provider adapters (Meta Graph, WaSender).
///
/// Mirrors the teacher's `ChannelError` shape: transport/auth/config
/// variants a caller can branch on, plus rate-limit which the send loop
/// needs to distinguish in order to apply the provider's own backoff.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("webhook signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("unrecognized or malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
