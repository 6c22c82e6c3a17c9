//! `send_media`, `search_media`, and `opt_out_conversation` (§4.5).
//!
//! `send_media`'s result is a JSON directive, not prose — `tool_loop`
//! intercepts it before the model ever sees the raw JSON (the model only
//! gets a short acknowledgement back). Re-sending the same media id into
//! the same conversation is a no-op success, not an error, so the model
//! doesn't have to track what it already sent.

use std::sync::Arc;

use async_trait::async_trait;

use wa_scheduler::SchedulerStore;
use wa_store::Store;

use super::{Tool, ToolResult};

const MAX_SEARCH_RESULTS: usize = 5;

pub struct SendMediaTool {
    store: Arc<Store>,
    scheduler_store: Arc<SchedulerStore>,
    agent_id: i64,
    conversation_id: i64,
}

impl SendMediaTool {
    pub fn new(
        store: Arc<Store>,
        scheduler_store: Arc<SchedulerStore>,
        agent_id: i64,
        conversation_id: i64,
    ) -> Self {
        Self { store, scheduler_store, agent_id, conversation_id }
    }
}

#[async_trait]
impl Tool for SendMediaTool {
    fn name(&self) -> &str {
        "send_media"
    }

    fn description(&self) -> &str {
        "Send a piece of pre-approved media (image, PDF, etc.) to the customer, \
         optionally with a caption. Use search_media first to find the right media_id."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "media_id": {"type": "string"},
                "caption": {"type": "string", "description": "Overrides the media's default caption, if any."}
            },
            "required": ["media_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let media_id = match input.get("media_id").and_then(|v| v.as_str()) {
            Some(id) if !id.trim().is_empty() => id,
            _ => return ToolResult::error("missing required parameter: media_id"),
        };
        let caption = input.get("caption").and_then(|v| v.as_str());

        let media = match self.scheduler_store.get_media_by_media_id(self.agent_id, media_id) {
            Ok(Some(m)) if m.active => m,
            Ok(Some(_)) => return ToolResult::error(format!("media {media_id} is no longer active")),
            Ok(None) => return ToolResult::error(format!("unknown media_id: {media_id}")),
            Err(e) => return ToolResult::error(format!("send_media failed: {e}")),
        };

        match self.store.media_already_sent(self.conversation_id, media_id) {
            Ok(true) => {
                return ToolResult::success(
                    serde_json::json!({
                        "action": "send_media",
                        "media_id": media_id,
                        "already_sent": true,
                    })
                    .to_string(),
                );
            }
            Ok(false) => {}
            Err(e) => return ToolResult::error(format!("send_media failed: {e}")),
        }

        ToolResult::success(
            serde_json::json!({
                "action": "send_media",
                "media_id": media_id,
                "url": media.url,
                "mime_type": media.mime_type,
                "caption": caption.or(media.default_caption.as_deref()),
            })
            .to_string(),
        )
    }
}

pub struct SearchMediaTool {
    scheduler_store: Arc<SchedulerStore>,
    agent_id: i64,
}

impl SearchMediaTool {
    pub fn new(scheduler_store: Arc<SchedulerStore>, agent_id: i64) -> Self {
        Self { scheduler_store, agent_id }
    }
}

#[async_trait]
impl Tool for SearchMediaTool {
    fn name(&self) -> &str {
        "search_media"
    }

    fn description(&self) -> &str {
        "Find pre-approved media by matching the search term against its display name, \
         to get the media_id needed by send_media."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search term, e.g. 'price list' or 'brochure'."}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = match input.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.to_ascii_lowercase(),
            _ => return ToolResult::error("missing required parameter: query"),
        };

        let all = match self.scheduler_store.list_active_media(self.agent_id) {
            Ok(m) => m,
            Err(e) => return ToolResult::error(format!("search_media failed: {e}")),
        };

        let matches: Vec<_> = all
            .into_iter()
            .filter(|m| m.display_name.to_ascii_lowercase().contains(&query))
            .take(MAX_SEARCH_RESULTS)
            .collect();

        if matches.is_empty() {
            return ToolResult::success(format!("No media found matching: {query}"));
        }

        let mut out = String::new();
        for m in &matches {
            out.push_str(&format!("- {} (media_id: {})\n", m.display_name, m.media_id));
        }
        ToolResult::success(out.trim_end().to_string())
    }
}

pub struct OptOutConversationTool {
    store: Arc<Store>,
    conversation_id: i64,
}

impl OptOutConversationTool {
    pub fn new(store: Arc<Store>, conversation_id: i64) -> Self {
        Self { store, conversation_id }
    }
}

#[async_trait]
impl Tool for OptOutConversationTool {
    fn name(&self) -> &str {
        "opt_out_conversation"
    }

    fn description(&self) -> &str {
        "Stop the bot from auto-replying in this conversation, for example when the customer \
         asks to speak to a human or to not be contacted. A new inbound message from the \
         customer automatically re-enables replies."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match self.store.set_opted_out(self.conversation_id, true) {
            Ok(()) => ToolResult::success("conversation opted out"),
            Err(e) => ToolResult::error(format!("opt_out_conversation failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn seed(store: &Store, scheduler_store: &SchedulerStore) -> (i64, i64) {
        let agent_id = store.create_agent("Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet").unwrap().id;
        let user = store.find_or_create_user_by_phone("+972500000040").unwrap();
        let conversation = store.find_or_create_conversation(agent_id, user.id).unwrap();
        scheduler_store
            .upsert_media(agent_id, "brochure", "https://x/brochure.pdf", "application/pdf", "Price Brochure", None)
            .unwrap();
        (agent_id, conversation.id)
    }

    #[tokio::test]
    async fn send_media_returns_directive_with_url_and_caption() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let (agent_id, conversation_id) = seed(&store, &scheduler_store);

        let tool = SendMediaTool::new(Arc::clone(&store), Arc::clone(&scheduler_store), agent_id, conversation_id);
        let result = tool.execute(serde_json::json!({"media_id": "brochure"})).await;
        assert!(!result.is_error);
        let directive: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(directive["media_id"], "brochure");
        assert_eq!(directive["url"], "https://x/brochure.pdf");
    }

    #[tokio::test]
    async fn send_media_unknown_id_is_an_error() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let (agent_id, conversation_id) = seed(&store, &scheduler_store);

        let tool = SendMediaTool::new(store, scheduler_store, agent_id, conversation_id);
        let result = tool.execute(serde_json::json!({"media_id": "nope"})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn search_media_matches_display_name_case_insensitively() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let (agent_id, _conversation_id) = seed(&store, &scheduler_store);

        let tool = SearchMediaTool::new(scheduler_store, agent_id);
        let result = tool.execute(serde_json::json!({"query": "brochure"})).await;
        assert!(!result.is_error);
        assert!(result.content.contains("brochure"));
    }

    #[tokio::test]
    async fn opt_out_marks_conversation() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let (_agent_id, conversation_id) = seed(&store, &scheduler_store);

        let tool = OptOutConversationTool::new(Arc::clone(&store), conversation_id);
        let result = tool.execute(serde_json::json!({})).await;
        assert!(!result.is_error);
        let conversation = store.get_conversation(conversation_id).unwrap();
        assert!(conversation.opted_out);
    }
}
