//! `search_knowledge` and `query_products` — read-only lookups against the
//! operator-curated knowledge base and product catalog (§4.5). Neither tool
//! writes: the model has no facility to create or edit either table.

use std::sync::Arc;

use async_trait::async_trait;

use wa_store::Store;

use super::{Tool, ToolResult};

const MAX_RESULTS: i64 = 5;

pub struct SearchKnowledgeTool {
    store: Arc<Store>,
    agent_id: i64,
}

impl SearchKnowledgeTool {
    pub fn new(store: Arc<Store>, agent_id: i64) -> Self {
        Self { store, agent_id }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "Search the business's knowledge base for facts, policies, or procedures \
         (e.g. opening hours, return policy, how a service works). Use this before answering \
         questions you aren't certain of from the system prompt alone."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search terms."}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = match input.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => return ToolResult::error("missing required parameter: query"),
        };

        match self.store.search_knowledge(self.agent_id, &query, MAX_RESULTS) {
            Ok(entries) if entries.is_empty() => {
                ToolResult::success(format!("No knowledge entries found for: {query}"))
            }
            Ok(entries) => {
                let mut out = String::new();
                for entry in &entries {
                    out.push_str(&format!("### {}\n{}\n\n", entry.topic, entry.content));
                }
                ToolResult::success(out.trim_end().to_string())
            }
            Err(e) => ToolResult::error(format!("search_knowledge failed: {e}")),
        }
    }
}

pub struct QueryProductsTool {
    store: Arc<Store>,
    agent_id: i64,
}

impl QueryProductsTool {
    pub fn new(store: Arc<Store>, agent_id: i64) -> Self {
        Self { store, agent_id }
    }
}

#[async_trait]
impl Tool for QueryProductsTool {
    fn name(&self) -> &str {
        "query_products"
    }

    fn description(&self) -> &str {
        "Look up products or services offered by this business, optionally filtered by a \
         search term (name or description). Returns active items only."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Optional search term; omit to list everything."}
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = input.get("query").and_then(|v| v.as_str());
        match self.store.query_products(self.agent_id, query, MAX_RESULTS) {
            Ok(products) if products.is_empty() => ToolResult::success("No matching products found."),
            Ok(products) => {
                let mut out = String::new();
                for p in &products {
                    out.push_str(&format!("- {} — {:.2}", p.name, p.price));
                    if let Some(sku) = &p.sku {
                        out.push_str(&format!(" (sku: {sku})"));
                    }
                    if !p.description.is_empty() {
                        out.push_str(&format!(": {}", p.description));
                    }
                    out.push('\n');
                }
                ToolResult::success(out.trim_end().to_string())
            }
            Err(e) => ToolResult::error(format!("query_products failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn seed_agent(store: &Store) -> i64 {
        store.create_agent("Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet").unwrap().id
    }

    #[tokio::test]
    async fn search_knowledge_returns_no_results_message_when_empty() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let agent_id = seed_agent(&store);
        let tool = SearchKnowledgeTool::new(Arc::clone(&store), agent_id);
        let result = tool.execute(serde_json::json!({"query": "hours"})).await;
        assert!(!result.is_error);
        assert!(result.content.contains("No knowledge entries"));
    }

    #[tokio::test]
    async fn query_products_lists_matching_active_products() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let agent_id = seed_agent(&store);
        store
            .create_product(agent_id, "Haircut", "30 minute cut", 80.0, Some("SKU1"))
            .unwrap();
        let tool = QueryProductsTool::new(Arc::clone(&store), agent_id);
        let result = tool.execute(serde_json::json!({"query": "hair"})).await;
        assert!(!result.is_error);
        assert!(result.content.contains("Haircut"));
    }
}
