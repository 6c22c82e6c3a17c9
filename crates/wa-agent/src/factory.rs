//! Selects which provider class handles a request. The only routing rule
//! the spec calls for (§4.4) is image content forcing Anthropic-class
//! regardless of the agent's configured model — there is no cross-provider
//! failover.

use std::sync::Arc;

use wa_core::config::LlmKeysConfig;

use crate::anthropic::AnthropicProvider;
use crate::google::GoogleProvider;
use crate::key_pool::KeyPool;
use crate::openai::OpenAiProvider;
use crate::provider::{ChatRequest, LlmProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderClass {
    Anthropic,
    Google,
    OpenAi,
}

/// Long-lived provider instances backed by the shared system key pools.
/// Per-agent key overrides bypass the pool entirely (see `KeyPool::next`'s
/// callers in each adapter), so an override request gets a throwaway
/// instance built around an empty pool rather than touching this state.
pub struct ProviderFactory {
    anthropic: Arc<AnthropicProvider>,
    google: Arc<GoogleProvider>,
    openai: Arc<OpenAiProvider>,
    anthropic_base_url: Option<String>,
    google_base_url: Option<String>,
    openai_base_url: Option<String>,
}

impl ProviderFactory {
    pub fn new(llm: &LlmKeysConfig) -> Self {
        Self::with_base_urls(llm, None, None, None)
    }

    pub fn with_base_urls(
        llm: &LlmKeysConfig,
        anthropic_base_url: Option<String>,
        google_base_url: Option<String>,
        openai_base_url: Option<String>,
    ) -> Self {
        let anthropic = AnthropicProvider::new(
            KeyPool::from_env_values(&llm.anthropic_api_keys, &llm.anthropic_api_key),
            None,
            anthropic_base_url.clone(),
        );
        let google = GoogleProvider::new(
            KeyPool::from_env_values(&llm.google_api_keys, &llm.google_api_key),
            None,
            google_base_url.clone(),
        );
        let openai = OpenAiProvider::new(
            KeyPool::from_env_values(&llm.openai_api_keys, &llm.openai_api_key),
            None,
            openai_base_url.clone(),
        );
        Self {
            anthropic: Arc::new(anthropic),
            google: Arc::new(google),
            openai: Arc::new(openai),
            anthropic_base_url,
            google_base_url,
            openai_base_url,
        }
    }

    /// Classifies a configured model name by its vendor prefix. Unrecognized
    /// names fall back to OpenAI-class, the most permissive wire format.
    pub fn class_for_model(model: &str) -> ProviderClass {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("claude") {
            ProviderClass::Anthropic
        } else if lower.starts_with("gemini") || lower.starts_with("models/gemini") {
            ProviderClass::Google
        } else {
            ProviderClass::OpenAi
        }
    }

    /// Picks the provider instance to use for `req`. `override_key` is the
    /// agent's `custom_api_keys` entry for the selected class, if any.
    pub fn select(
        &self,
        model: &str,
        override_key: Option<&str>,
        has_image: bool,
    ) -> Arc<dyn LlmProvider> {
        let class = if has_image {
            ProviderClass::Anthropic
        } else {
            Self::class_for_model(model)
        };

        match (class, override_key) {
            (ProviderClass::Anthropic, None) => Arc::clone(&self.anthropic) as Arc<dyn LlmProvider>,
            (ProviderClass::Anthropic, Some(key)) => Arc::new(AnthropicProvider::new(
                KeyPool::from_env_values("", ""),
                Some(key.to_string()),
                self.anthropic_base_url.clone(),
            )) as Arc<dyn LlmProvider>,
            (ProviderClass::Google, None) => Arc::clone(&self.google) as Arc<dyn LlmProvider>,
            (ProviderClass::Google, Some(key)) => Arc::new(GoogleProvider::new(
                KeyPool::from_env_values("", ""),
                Some(key.to_string()),
                self.google_base_url.clone(),
            )) as Arc<dyn LlmProvider>,
            (ProviderClass::OpenAi, None) => Arc::clone(&self.openai) as Arc<dyn LlmProvider>,
            (ProviderClass::OpenAi, Some(key)) => Arc::new(OpenAiProvider::new(
                KeyPool::from_env_values("", ""),
                Some(key.to_string()),
                self.openai_base_url.clone(),
            )) as Arc<dyn LlmProvider>,
        }
    }

    /// Selects directly from a fully-built request, applying the image
    /// routing rule from the request's own content.
    pub fn select_for_request(&self, req: &ChatRequest, override_key: Option<&str>) -> Arc<dyn LlmProvider> {
        self.select(&req.model, override_key, req.has_image_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_keys() -> LlmKeysConfig {
        LlmKeysConfig::default()
    }

    #[test]
    fn classifies_by_model_prefix() {
        assert_eq!(ProviderFactory::class_for_model("claude-3-5-sonnet"), ProviderClass::Anthropic);
        assert_eq!(ProviderFactory::class_for_model("gemini-1.5-pro"), ProviderClass::Google);
        assert_eq!(ProviderFactory::class_for_model("gpt-4o"), ProviderClass::OpenAi);
    }

    #[test]
    fn image_content_forces_anthropic_regardless_of_model() {
        let factory = ProviderFactory::new(&empty_keys());
        let provider = factory.select("gpt-4o", None, true);
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn no_image_content_routes_by_model() {
        let factory = ProviderFactory::new(&empty_keys());
        assert_eq!(factory.select("gemini-1.5-pro", None, false).name(), "google");
        assert_eq!(factory.select("gpt-4o", None, false).name(), "openai");
    }

    #[test]
    fn override_key_bypasses_the_shared_pool() {
        let factory = ProviderFactory::new(&empty_keys());
        // The shared pool is empty, so without an override this would fail
        // on first send; the override path must not touch it.
        let provider = factory.select("claude-3-5-sonnet", Some("sk-agent-key"), false);
        assert_eq!(provider.name(), "anthropic");
    }
}
