//! Anthropic-class provider: native `/v1/messages` tool use with ephemeral
//! prompt caching on the leading system block, and the only adapter that
//! accepts inbound image content (§4.4 — the factory routes any request
//! carrying an image block here regardless of the agent's configured model).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use wa_core::model::TokenUsage;

use crate::error::{AgentError, Result};
use crate::key_pool::KeyPool;
use crate::provider::{Block, ChatRequest, ChatResponse, LlmProvider, Role, StopReason};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    keys: KeyPool,
    override_key: Option<String>,
}

impl AnthropicProvider {
    pub fn new(keys: KeyPool, override_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            keys,
            override_key,
        }
    }

    fn select_key(&self) -> Result<String> {
        if let Some(ref k) = self.override_key {
            return Ok(k.clone());
        }
        self.keys.next()
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let key = self.select_key()?;
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, "sending request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("x-api-key", &key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            if self.override_key.is_none() {
                self.keys.mark_dead(&key);
            }
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::Api { status, message: text });
        }
        if status == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000);
            if self.override_key.is_none() {
                self.keys
                    .mark_rate_limited(&key, Some(std::time::Duration::from_millis(retry_after_ms)));
            }
            return Err(AgentError::RateLimited { retry_after_ms });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(AgentError::Api { status, message: text });
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| AgentError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn block_to_json(block: &Block) -> serde_json::Value {
    match block {
        Block::Text(text) => serde_json::json!({"type": "text", "text": text}),
        Block::Image { mime_type, data_base64 } => serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": mime_type,
                "data": data_base64,
            },
        }),
        Block::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        Block::ToolResult { tool_use_id, content, is_error } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": role_str(m.role),
                "content": m.blocks.iter().map(block_to_json).collect::<Vec<_>>(),
            })
        })
        .collect();

    // The first system block is cache-eligible; Anthropic marks caching per
    // block via `cache_control`, so only that block carries the marker.
    let system: Vec<serde_json::Value> = req
        .system_blocks
        .iter()
        .map(|b| {
            if b.cache {
                serde_json::json!({
                    "type": "text",
                    "text": b.text,
                    "cache_control": {"type": "ephemeral"},
                })
            } else {
                serde_json::json!({"type": "text", "text": b.text})
            }
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "system": system,
        "messages": messages,
        "stream": false,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let blocks = resp
        .content
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(Block::Text(text)),
            ContentBlock::ToolUse { id, name, input } => Some(Block::ToolUse { id, name, input }),
            ContentBlock::Unknown => None,
        })
        .collect();

    let stop_reason = match resp.stop_reason.as_deref() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
        _ => StopReason::Other,
    };

    ChatResponse {
        blocks,
        usage: TokenUsage {
            input_tokens: resp.usage.input_tokens as i64,
            output_tokens: resp.usage.output_tokens as i64,
            cache_read_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0) as i64,
            cache_creation_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0) as i64,
        },
        stop_reason,
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}
