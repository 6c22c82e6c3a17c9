//! Thin facade over `ProviderFactory` + the tool loop (§4.4): picks the
//! right provider for an agent's configured model and custom key override,
//! then runs the request through `tools::tool_loop::run_tool_loop`.

use std::sync::Arc;

use wa_core::model::Agent;

use crate::factory::ProviderFactory;
use crate::provider::ChatRequest;
use crate::tools::tool_loop::{run_tool_loop, ToolLoopOutcome};
use crate::tools::Tool;
use crate::Result;

pub struct AgentRuntime {
    factory: Arc<ProviderFactory>,
}

impl AgentRuntime {
    pub fn new(factory: Arc<ProviderFactory>) -> Self {
        Self { factory }
    }

    /// Runs one turn: selects the provider for `agent`'s model (and its
    /// `custom_api_keys` override, if any, and the image-content routing
    /// rule from the request itself), then drives the tool loop to
    /// completion.
    pub async fn run_turn(
        &self,
        agent: &Agent,
        request: ChatRequest,
        tools: &[Box<dyn Tool>],
    ) -> Result<ToolLoopOutcome> {
        let class = resolve_class(&agent.llm_model, request.has_image_content());
        let override_key = override_key_for_class(agent, class);
        let provider = self.factory.select_for_request(&request, override_key);
        run_tool_loop(provider.as_ref(), request, tools).await
    }
}

/// The class that will actually serve a request may differ from the agent's
/// configured model class: image content forces Anthropic regardless of
/// `agent.llm_model`. The override key must be looked up for that same
/// forced class, or an image-bearing request on a non-Anthropic agent would
/// apply the wrong vendor's key to the Anthropic call `select_for_request`
/// ends up making.
fn resolve_class(model: &str, has_image: bool) -> crate::factory::ProviderClass {
    if has_image {
        crate::factory::ProviderClass::Anthropic
    } else {
        ProviderFactory::class_for_model(model)
    }
}

fn override_key_for_class(agent: &Agent, class: crate::factory::ProviderClass) -> Option<&str> {
    let key_name = match class {
        crate::factory::ProviderClass::Anthropic => "anthropic",
        crate::factory::ProviderClass::Google => "google",
        crate::factory::ProviderClass::OpenAi => "openai",
    };
    agent.custom_api_keys.get(key_name).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ProviderClass;
    use chrono::Utc;
    use wa_core::model::WhatsAppProvider;

    fn sample_agent(llm_model: &str, custom_api_keys: std::collections::HashMap<String, String>) -> Agent {
        Agent {
            id: 1,
            name: "Bot".into(),
            active: true,
            provider: WhatsAppProvider::Meta,
            credentials: Default::default(),
            llm_model: llm_model.into(),
            custom_api_keys,
            system_prompt: "you help customers".into(),
            timezone: "Asia/Jerusalem".into(),
            batching: Default::default(),
            calendar: Default::default(),
            reminders: Default::default(),
            summaries: Default::default(),
            followups: Default::default(),
            media: Default::default(),
            context_summary: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn resolve_class_follows_model_prefix_without_images() {
        assert_eq!(resolve_class("gpt-4o", false), ProviderClass::OpenAi);
        assert_eq!(resolve_class("gemini-1.5-pro", false), ProviderClass::Google);
        assert_eq!(resolve_class("claude-3-5-sonnet", false), ProviderClass::Anthropic);
    }

    #[test]
    fn resolve_class_forces_anthropic_when_request_has_images() {
        assert_eq!(resolve_class("gpt-4o", true), ProviderClass::Anthropic);
    }

    #[test]
    fn override_key_matches_the_class_actually_serving_the_request() {
        let mut keys = std::collections::HashMap::new();
        keys.insert("openai".to_string(), "sk-openai-agent-key".to_string());
        keys.insert("anthropic".to_string(), "sk-anthropic-agent-key".to_string());
        let agent = sample_agent("gpt-4o", keys);

        // Without images, the agent's own gpt-4o key applies.
        let no_image_class = resolve_class(&agent.llm_model, false);
        assert_eq!(override_key_for_class(&agent, no_image_class), Some("sk-openai-agent-key"));

        // With images, the request is forced to Anthropic, so the override
        // must be the agent's anthropic key, never the openai one.
        let image_class = resolve_class(&agent.llm_model, true);
        assert_eq!(override_key_for_class(&agent, image_class), Some("sk-anthropic-agent-key"));
    }
}
