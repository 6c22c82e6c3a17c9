//! OpenAI-class provider: function-calling tool schema, system blocks
//! concatenated into a single system message (no prompt caching — §4.4).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use wa_core::model::TokenUsage;

use crate::error::{AgentError, Result};
use crate::key_pool::KeyPool;
use crate::provider::{Block, ChatRequest, ChatResponse, LlmProvider, Role, StopReason};

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    keys: KeyPool,
    override_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(keys: KeyPool, override_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
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
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let key = self.select_key()?;
        let body = build_request_body(req);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %req.model, "sending request to OpenAI");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&key)
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
            warn!(status, body = %text, "OpenAI API error");
            return Err(AgentError::Api { status, message: text });
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| AgentError::Parse(e.to_string()))?;
        parse_response(api_resp)
    }
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let mut messages = Vec::new();

    let system_text = req
        .system_blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    if !system_text.is_empty() {
        messages.push(serde_json::json!({ "role": "system", "content": system_text }));
    }

    for m in &req.messages {
        match m.role {
            Role::User => {
                let mut text_parts = Vec::new();
                for block in &m.blocks {
                    match block {
                        Block::Text(t) => text_parts.push(t.clone()),
                        Block::ToolResult { tool_use_id, content, .. } => {
                            messages.push(serde_json::json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        Block::Image { .. } | Block::ToolUse { .. } => {}
                    }
                }
                if !text_parts.is_empty() {
                    messages.push(serde_json::json!({
                        "role": role_str(m.role),
                        "content": text_parts.join("\n"),
                    }));
                }
            }
            Role::Assistant => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in &m.blocks {
                    match block {
                        Block::Text(t) => text_parts.push(t.clone()),
                        Block::ToolUse { id, name, input } => {
                            tool_calls.push(serde_json::json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                                },
                            }));
                        }
                        Block::Image { .. } | Block::ToolResult { .. } => {}
                    }
                }
                let mut entry = serde_json::json!({ "role": "assistant" });
                entry["content"] = if text_parts.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::String(text_parts.join("\n"))
                };
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = serde_json::Value::Array(tool_calls);
                }
                messages.push(entry);
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn parse_response(resp: ApiResponse) -> Result<ChatResponse> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Parse("openai response had no choices".into()))?;

    let mut blocks = Vec::new();
    if let Some(content) = choice.message.content {
        if !content.is_empty() {
            blocks.push(Block::Text(content));
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
        blocks.push(Block::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some("stop") => StopReason::EndTurn,
        _ => StopReason::Other,
    };

    Ok(ChatResponse {
        blocks,
        usage: TokenUsage {
            input_tokens: resp.usage.prompt_tokens as i64,
            output_tokens: resp.usage.completion_tokens as i64,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
        },
        stop_reason,
    })
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    id: String,
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Message, SystemBlock, ToolDefinition};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            system_blocks: vec![SystemBlock::uncached("You are a helpful agent.")],
            messages: vec![Message::user_text("hi")],
            tools: vec![ToolDefinition {
                name: "search_knowledge".into(),
                description: "search".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            max_tokens: 512,
        }
    }

    #[test]
    fn request_body_carries_system_message_and_tools() {
        let body = build_request_body(&sample_request());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["name"], "search_knowledge");
    }

    #[test]
    fn tool_result_becomes_tool_role_message() {
        let mut req = sample_request();
        req.messages.push(Message {
            role: Role::User,
            blocks: vec![Block::ToolResult {
                tool_use_id: "call_1".into(),
                content: "3 results".into(),
                is_error: false,
            }],
        });
        let body = build_request_body(&req);
        let messages = body["messages"].as_array().unwrap();
        let tool_msg = messages.iter().find(|m| m["role"] == "tool").unwrap();
        assert_eq!(tool_msg["tool_call_id"], "call_1");
    }

    #[test]
    fn parse_response_extracts_tool_use_and_stop_reason() {
        let resp = ApiResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: None,
                    tool_calls: Some(vec![ToolCall {
                        id: "call_1".into(),
                        function: ToolCallFunction {
                            name: "search_knowledge".into(),
                            arguments: "{\"query\":\"hours\"}".into(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: Usage { prompt_tokens: 10, completion_tokens: 5 },
        };
        let parsed = parse_response(resp).unwrap();
        assert_eq!(parsed.stop_reason, StopReason::ToolUse);
        assert_eq!(parsed.tool_uses().len(), 1);
    }
}
