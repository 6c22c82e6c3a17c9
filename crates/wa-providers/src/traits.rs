use async_trait::async_trait;

use crate::error::Result;
use crate::types::OutboundContent;

/// Speech-to-text for inbound voice notes. The core only orchestrates
/// "resolve before dispatch, sentinel on failure" — the model call itself is
/// an external collaborator handed in at construction (§1's fixed-contract
/// boundary), same as the teacher's `Channel` trait abstracts transport.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_bytes: &[u8], mime_type: &str) -> Result<String>;
}

/// Vision description for inbound images, in the agent's configured
/// language (Hebrew by default per the original deployment).
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, image_bytes: &[u8], mime_type: &str) -> Result<String>;
}

/// Outbound send surface implemented once per provider (Meta Graph,
/// WaSender). `&self` (not `&mut self`) since a provider client sends
/// concurrently across conversations without a mutable borrow, matching the
/// teacher's `Channel::send` signature.
#[async_trait]
pub trait WhatsAppSender: Send + Sync {
    async fn send(&self, to_phone: &str, content: OutboundContent<'_>) -> Result<()>;
}
