//! Image description (C1's "resolve before dispatch" step for inbound
//! images) via the same LLM stack that serves conversation turns.
//! Deliberately no audio transcriber: this deployment has no grounded
//! speech-to-text crate anywhere in the stack, so voice notes fall straight
//! to the dispatcher's `"[voice — could not transcribe]"` sentinel. Adding
//! one would mean fabricating a dependency this corpus never reaches for.

use std::sync::Arc;

use wa_agent::factory::ProviderFactory;
use wa_agent::{Block, ChatRequest, LlmProvider, Message, Role, SystemBlock};
use wa_providers::error::{ProviderError, Result};
use wa_providers::traits::ImageDescriber;

const DESCRIBE_PROMPT: &str = "Describe this image in one or two sentences, in plain language, \
for a customer-support assistant reading it as part of a chat transcript. Mention any visible \
text verbatim.";

pub struct LlmImageDescriber {
    factory: Arc<ProviderFactory>,
}

impl LlmImageDescriber {
    pub fn new(factory: Arc<ProviderFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait::async_trait]
impl ImageDescriber for LlmImageDescriber {
    async fn describe(&self, image_bytes: &[u8], mime_type: &str) -> Result<String> {
        use base64::Engine;
        let data_base64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);

        let request = ChatRequest {
            model: "claude-3-5-sonnet-latest".to_string(),
            system_blocks: vec![SystemBlock::uncached("You describe images for a text-only chat log.")],
            messages: vec![Message {
                role: Role::User,
                blocks: vec![
                    Block::Image { mime_type: mime_type.to_string(), data_base64 },
                    Block::text(DESCRIBE_PROMPT),
                ],
            }],
            tools: Vec::new(),
            max_tokens: 256,
        };

        // `select_for_request` routes any request with image content to
        // Anthropic regardless of `request.model`, so the literal above is
        // only ever used as the (ignored) fallback class hint.
        let provider = self.factory.select_for_request(&request, None);
        let response = provider
            .send(&request)
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?;

        let text = response.text();
        if text.trim().is_empty() {
            return Err(ProviderError::MalformedPayload("image describer returned no text".into()));
        }
        Ok(text)
    }
}
