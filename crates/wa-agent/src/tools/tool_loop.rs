//! Tool execution loop (§4.4): prompt → LLM → if `tool_use` → execute tools →
//! inject results → LLM → repeat, capped at 5 rounds. `send_media` results
//! are intercepted: the model only sees a short acknowledgement, while the
//! actual media directive is collected into a side-channel the orchestrator
//! sends to the provider after the loop completes.

use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::provider::{Block, ChatRequest, ChatResponse, LlmProvider, Message, Role};

use super::{Tool, ToolResult};

/// §4.4: the tool loop runs at most 5 rounds before returning whatever the
/// last response was.
const MAX_ROUNDS: usize = 5;

const SEND_MEDIA_TOOL: &str = "send_media";
const SEND_MEDIA_ACK: &str = "media sent";

/// Final result of a tool loop run: the model's last response plus any
/// media directives `send_media` calls produced along the way.
pub struct ToolLoopOutcome {
    pub response: ChatResponse,
    pub media_actions: Vec<serde_json::Value>,
}

pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    initial_request: ChatRequest,
    tools: &[Box<dyn Tool>],
) -> Result<ToolLoopOutcome> {
    let mut messages = initial_request.messages.clone();
    let mut media_actions = Vec::new();
    let mut last_response: Option<ChatResponse> = None;

    for round in 0..MAX_ROUNDS {
        let req = ChatRequest {
            messages: messages.clone(),
            ..clone_request_shape(&initial_request)
        };

        debug!(round, "tool loop round");

        let response = provider.send(&req).await?;

        if !response.blocks.iter().any(|b| matches!(b, Block::ToolUse { .. })) {
            info!(round, "tool loop complete, no tool calls");
            return Ok(ToolLoopOutcome { response, media_actions });
        }

        messages.push(Message { role: Role::Assistant, blocks: response.blocks.clone() });

        let tool_uses: Vec<(String, String, serde_json::Value)> = response
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse { id, name, input } => Some((id.clone(), name.clone(), input.clone())),
                _ => None,
            })
            .collect();

        let mut result_blocks = Vec::new();
        for (id, name, input) in tool_uses {
            let result = execute_tool(tools, &name, input).await;
            if name == SEND_MEDIA_TOOL && !result.is_error {
                if let Ok(directive) = serde_json::from_str::<serde_json::Value>(&result.content) {
                    media_actions.push(directive);
                }
                result_blocks.push(Block::ToolResult {
                    tool_use_id: id,
                    content: SEND_MEDIA_ACK.to_string(),
                    is_error: false,
                });
            } else {
                result_blocks.push(Block::ToolResult {
                    tool_use_id: id,
                    content: result.content,
                    is_error: result.is_error,
                });
            }
        }

        messages.push(Message { role: Role::User, blocks: result_blocks });

        last_response = Some(response);
    }

    warn!(max_rounds = MAX_ROUNDS, "tool loop hit round cap");

    match last_response {
        Some(response) => Ok(ToolLoopOutcome { response, media_actions }),
        None => Err(AgentError::Tool(format!(
            "tool loop exceeded {MAX_ROUNDS} rounds without a final response"
        ))),
    }
}

fn clone_request_shape(req: &ChatRequest) -> ChatRequest {
    ChatRequest {
        model: req.model.clone(),
        system_blocks: req.system_blocks.clone(),
        messages: Vec::new(),
        tools: req.tools.clone(),
        max_tokens: req.max_tokens,
    }
}

async fn execute_tool(tools: &[Box<dyn Tool>], name: &str, input: serde_json::Value) -> ToolResult {
    match tools.iter().find(|t| t.name() == name) {
        Some(tool) => {
            debug!(tool = %name, "executing tool");
            tool.execute(input).await
        }
        None => ToolResult::error(format!("unknown tool: {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{StopReason, SystemBlock, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wa_core::model::TokenUsage;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input.to_string())
        }
    }

    struct SendMediaTool;

    #[async_trait]
    impl Tool for SendMediaTool {
        fn name(&self) -> &str {
            SEND_MEDIA_TOOL
        }
        fn description(&self) -> &str {
            "sends media"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::success(r#"{"action":"send_media","media_id":"m1"}"#)
        }
    }

    /// Calls the tool on round 0, then stops on round 1.
    struct ScriptedProvider {
        calls: AtomicUsize,
        tool_name: &'static str,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(ChatResponse {
                    blocks: vec![Block::ToolUse {
                        id: "call_1".into(),
                        name: self.tool_name.to_string(),
                        input: serde_json::json!({}),
                    }],
                    usage: TokenUsage::default(),
                    stop_reason: StopReason::ToolUse,
                })
            } else {
                Ok(ChatResponse {
                    blocks: vec![Block::Text("done".into())],
                    usage: TokenUsage::default(),
                    stop_reason: StopReason::EndTurn,
                })
            }
        }
    }

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet".into(),
            system_blocks: vec![SystemBlock::uncached("system")],
            messages: vec![Message::user_text("hi")],
            tools: vec![ToolDefinition {
                name: "echo".into(),
                description: "echo".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            max_tokens: 256,
        }
    }

    #[tokio::test]
    async fn stops_once_no_tool_calls_remain() {
        let provider = ScriptedProvider { calls: AtomicUsize::new(0), tool_name: "echo" };
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let outcome = run_tool_loop(&provider, base_request(), &tools).await.unwrap();
        assert_eq!(outcome.response.text(), "done");
        assert!(outcome.media_actions.is_empty());
    }

    #[tokio::test]
    async fn send_media_result_is_intercepted_into_side_channel() {
        let provider = ScriptedProvider { calls: AtomicUsize::new(0), tool_name: SEND_MEDIA_TOOL };
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(SendMediaTool)];
        let outcome = run_tool_loop(&provider, base_request(), &tools).await.unwrap();
        assert_eq!(outcome.media_actions.len(), 1);
        assert_eq!(outcome.media_actions[0]["media_id"], "m1");
    }

    #[tokio::test]
    async fn unknown_tool_call_returns_error_result_without_panicking() {
        let provider = ScriptedProvider { calls: AtomicUsize::new(0), tool_name: "nonexistent" };
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let outcome = run_tool_loop(&provider, base_request(), &tools).await.unwrap();
        assert_eq!(outcome.response.text(), "done");
    }
}
