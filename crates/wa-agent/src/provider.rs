//! Provider-agnostic request/response shapes shared by the Anthropic-class,
//! OpenAI-class, and Google-class adapters. Every adapter translates this
//! typed representation to and from its own wire format — the tool loop and
//! orchestrator never see a provider-specific payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use wa_core::model::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One piece of message content. A single turn can carry several blocks
/// (e.g. text followed by a tool call, or an image followed by a caption).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Text(String),
    /// Inbound image content — Anthropic-class only; the factory routes any
    /// request carrying this block away from Google-class regardless of the
    /// agent's configured model.
    Image { mime_type: String, data_base64: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl Block {
    pub fn text(s: impl Into<String>) -> Self {
        Block::Text(s.into())
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Block::Image { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl Message {
    pub fn user_text(s: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![Block::text(s)],
        }
    }

    pub fn assistant_text(s: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            blocks: vec![Block::text(s)],
        }
    }

    pub fn has_image(&self) -> bool {
        self.blocks.iter().any(Block::is_image)
    }
}

/// One block of the system prompt. `cache` marks it eligible for
/// Anthropic's ephemeral prompt caching (§4.3's "cacheable block").
#[derive(Debug, Clone)]
pub struct SystemBlock {
    pub text: String,
    pub cache: bool,
}

impl SystemBlock {
    pub fn cached(text: impl Into<String>) -> Self {
        Self { text: text.into(), cache: true }
    }

    pub fn uncached(text: impl Into<String>) -> Self {
        Self { text: text.into(), cache: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_blocks: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// `true` if any user/assistant turn already carries an image block —
    /// the factory's signal to force Anthropic-class regardless of model.
    pub fn has_image_content(&self) -> bool {
        self.messages.iter().any(Message::has_image)
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub blocks: Vec<Block>,
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
}

impl ChatResponse {
    /// Concatenation of every text block, the shape callers that don't care
    /// about tool calls want.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, req: &ChatRequest) -> crate::error::Result<ChatResponse>;
}
