//! Tool system for model-facing tool calls (C5). Defines the `Tool` trait
//! every tool implements, plus the fixed catalog §4.5 names.

pub mod calendar;
pub mod knowledge;
pub mod media;
pub mod tool_loop;
pub mod user_info;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { content: message.into(), is_error: true }
    }
}

/// Trait every model-facing tool implements. Instances are built fresh per
/// turn with the agent/conversation/user already bound — `execute` itself
/// only ever sees the model's arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// The fixed canonical tool catalog (§1, §4.5) — every agent offers exactly
/// these, never a per-agent subset.
pub const TOOL_NAMES: &[&str] = &[
    "update_user_info",
    "search_knowledge",
    "query_products",
    "check_availability",
    "book_appointment",
    "get_my_appointments",
    "cancel_appointment",
    "reschedule_appointment",
    "send_media",
    "search_media",
    "opt_out_conversation",
];

pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}

/// Builds the fixed catalog (§4.5, `TOOL_NAMES`) with the current turn's
/// agent/user/conversation already bound into each tool.
pub fn build_all(
    store: std::sync::Arc<wa_store::Store>,
    scheduler_store: std::sync::Arc<wa_scheduler::SchedulerStore>,
    agent: std::sync::Arc<wa_core::model::Agent>,
    user_id: i64,
    conversation_id: i64,
) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(user_info::UpdateUserInfoTool::new(store.clone(), user_id)),
        Box::new(knowledge::SearchKnowledgeTool::new(store.clone(), agent.id)),
        Box::new(knowledge::QueryProductsTool::new(store.clone(), agent.id)),
        Box::new(calendar::CheckAvailabilityTool::new(scheduler_store.clone(), agent.id)),
        Box::new(calendar::BookAppointmentTool::new(scheduler_store.clone(), agent.clone(), user_id)),
        Box::new(calendar::GetMyAppointmentsTool::new(scheduler_store.clone(), agent.id, user_id)),
        Box::new(calendar::CancelAppointmentTool::new(scheduler_store.clone(), user_id)),
        Box::new(calendar::RescheduleAppointmentTool::new(scheduler_store.clone(), agent.clone(), user_id)),
        Box::new(media::SendMediaTool::new(store.clone(), scheduler_store.clone(), agent.id, conversation_id)),
        Box::new(media::SearchMediaTool::new(scheduler_store, agent.id)),
        Box::new(media::OptOutConversationTool::new(store, conversation_id)),
    ]
}
