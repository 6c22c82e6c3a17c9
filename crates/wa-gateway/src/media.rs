//! Concrete `wa_providers::dispatcher::MediaFetcher` implementations (C1):
//! one per provider, since downloading the bytes behind a media handle is
//! always provider-authenticated (Meta needs the agent's Graph access
//! token, WaSender needs its session-scoped decrypt endpoint).

use wa_core::model::{MetaCredentials, WasenderCredentials};
use wa_providers::dispatcher::MediaFetcher;
use wa_providers::error::{ProviderError, Result};

const GRAPH_BASE: &str = "https://graph.facebook.com/v22.0";

/// Meta media download is a two-step dance: `GET /{media_id}` returns a
/// short-lived signed `url`, then that URL is fetched with the same bearer
/// token attached.
pub struct GraphMediaFetcher {
    client: reqwest::Client,
    credentials: MetaCredentials,
}

impl GraphMediaFetcher {
    pub fn new(client: reqwest::Client, credentials: MetaCredentials) -> Self {
        Self { client, credentials }
    }
}

#[async_trait::async_trait]
impl MediaFetcher for GraphMediaFetcher {
    async fn fetch(&self, media_handle: &str, _mime_type: &str) -> Result<Vec<u8>> {
        let meta: serde_json::Value = self
            .client
            .get(format!("{GRAPH_BASE}/{media_handle}"))
            .bearer_auth(&self.credentials.access_token)
            .send()
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::MalformedPayload(e.to_string()))?;

        let url = meta
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::MalformedPayload("media lookup had no url".into()))?;

        let bytes = self
            .client
            .get(url)
            .bearer_auth(&self.credentials.access_token)
            .send()
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?;

        Ok(bytes.to_vec())
    }
}

/// WaSender hands back encrypted media references; `/decrypt-media` returns
/// the plaintext bytes base64-encoded, scoped to the session that received
/// the message.
pub struct WaSenderMediaFetcher {
    client: reqwest::Client,
    credentials: WasenderCredentials,
    base_url: String,
}

impl WaSenderMediaFetcher {
    pub fn new(client: reqwest::Client, credentials: WasenderCredentials) -> Self {
        Self {
            client,
            credentials,
            base_url: "https://www.wasenderapi.com/api".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl MediaFetcher for WaSenderMediaFetcher {
    async fn fetch(&self, media_handle: &str, _mime_type: &str) -> Result<Vec<u8>> {
        let resp: serde_json::Value = self
            .client
            .post(format!("{}/decrypt-media", self.base_url))
            .bearer_auth(&self.credentials.api_key)
            .json(&serde_json::json!({
                "session": self.credentials.session,
                "data": media_handle,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::MalformedPayload(e.to_string()))?;

        let data_b64 = resp
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::MalformedPayload("decrypt-media returned no data".into()))?;

        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|e| ProviderError::MalformedPayload(e.to_string()))
    }
}
