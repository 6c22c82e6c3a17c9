//! Google-class provider: Gemini `generateContent`, tool declarations
//! converted from the shared schema, no image support (§4.4 — the factory
//! routes any request carrying an image block to Anthropic-class instead).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use wa_core::model::TokenUsage;

use crate::error::{AgentError, Result};
use crate::key_pool::KeyPool;
use crate::provider::{Block, ChatRequest, ChatResponse, LlmProvider, Role, StopReason};

pub struct GoogleProvider {
    client: reqwest::Client,
    base_url: String,
    keys: KeyPool,
    override_key: Option<String>,
}

impl GoogleProvider {
    pub fn new(keys: KeyPool, override_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
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
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let key = self.select_key()?;
        let body = build_request_body(req);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, req.model, key
        );

        debug!(model = %req.model, "sending request to Google");

        let resp = self.client.post(&url).json(&body).send().await?;

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
            warn!(status, body = %text, "Google API error");
            return Err(AgentError::Api { status, message: text });
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| AgentError::Parse(e.to_string()))?;
        parse_response(api_resp)
    }
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::User => "user",
        // Gemini calls the model turn "model", not "assistant".
        Role::Assistant => "model",
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let system_text = req
        .system_blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            let parts: Vec<serde_json::Value> = m
                .blocks
                .iter()
                .filter_map(|block| match block {
                    Block::Text(t) => Some(serde_json::json!({ "text": t })),
                    Block::ToolUse { name, input, .. } => Some(serde_json::json!({
                        "functionCall": { "name": name, "args": input },
                    })),
                    Block::ToolResult { tool_use_id, content, .. } => Some(serde_json::json!({
                        "functionResponse": {
                            "name": tool_use_id,
                            "response": { "content": content },
                        },
                    })),
                    // Google-class never receives image blocks; the factory
                    // routes those requests to Anthropic-class instead.
                    Block::Image { .. } => None,
                })
                .collect();
            serde_json::json!({ "role": role_str(m.role), "parts": parts })
        })
        .collect();

    let mut body = serde_json::json!({ "contents": contents });

    if !system_text.is_empty() {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system_text }] });
    }

    if !req.tools.is_empty() {
        let declarations: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
    }

    body["generationConfig"] = serde_json::json!({ "maxOutputTokens": req.max_tokens });

    body
}

fn parse_response(resp: ApiResponse) -> Result<ChatResponse> {
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Parse("google response had no candidates".into()))?;

    let mut blocks = Vec::new();
    let mut call_seq = 0usize;
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            blocks.push(Block::Text(text));
        }
        if let Some(call) = part.function_call {
            call_seq += 1;
            blocks.push(Block::ToolUse {
                id: format!("{}-{}", call.name, call_seq),
                name: call.name,
                input: call.args.unwrap_or(serde_json::Value::Null),
            });
        }
    }

    let stop_reason = match candidate.finish_reason.as_deref() {
        Some("STOP") => {
            if blocks.iter().any(|b| matches!(b, Block::ToolUse { .. })) {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        }
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        _ => StopReason::Other,
    };

    let usage = resp.usage_metadata.unwrap_or_default();

    Ok(ChatResponse {
        blocks,
        usage: TokenUsage {
            input_tokens: usage.prompt_token_count as i64,
            output_tokens: usage.candidates_token_count as i64,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
        },
        stop_reason,
    })
}

#[derive(Deserialize)]
struct ApiResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Content,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    args: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Message, SystemBlock, ToolDefinition};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gemini-1.5-pro".into(),
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
    fn request_body_uses_model_role_and_function_declarations() {
        let mut req = sample_request();
        req.messages.push(Message::assistant_text("hello back"));
        let body = build_request_body(&req);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "search_knowledge"
        );
    }

    #[test]
    fn image_blocks_are_dropped_from_parts() {
        let mut req = sample_request();
        req.messages.push(Message {
            role: Role::User,
            blocks: vec![Block::Image {
                mime_type: "image/png".into(),
                data_base64: "zzz".into(),
            }],
        });
        let body = build_request_body(&req);
        let parts = body["contents"][1]["parts"].as_array().unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn parse_response_maps_function_call_to_tool_use() {
        let resp = ApiResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts: vec![Part {
                        text: None,
                        function_call: Some(FunctionCall {
                            name: "search_knowledge".into(),
                            args: Some(serde_json::json!({"query": "hours"})),
                        }),
                    }],
                },
                finish_reason: Some("STOP".into()),
            }],
            usage_metadata: Some(UsageMetadata { prompt_token_count: 8, candidates_token_count: 4 }),
        };
        let parsed = parse_response(resp).unwrap();
        assert_eq!(parsed.stop_reason, StopReason::ToolUse);
        assert_eq!(parsed.tool_uses().len(), 1);
    }
}
