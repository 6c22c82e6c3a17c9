//! C1 Inbound Dispatcher: dedup, media resolution, and handoff.
//!
//! The HTTP-layer webhook handlers (owned by `wa-gateway`) parse the
//! provider envelope via `meta::parse_webhook_envelope` /
//! `wasender::parse_webhook_event` and pass the resulting `InboundEvent`(s)
//! here. This module never touches axum — it only knows dedup, transcription
//! and image description, the three things the spec calls out as "resolve
//! before dispatch, sentinel on failure".

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use wa_core::kv::SharedStore;

use crate::traits::{ImageDescriber, Transcriber};
use crate::types::{InboundEvent, InboundMsgType};

const DEDUP_TTL: Duration = Duration::from_secs(300);
const IMAGE_FAILURE_SENTINEL: &str = "[image — could not download]";

#[async_trait::async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download the bytes behind a provider media handle (Meta media id,
    /// or a WaSender-encrypted media reference resolved via
    /// `/decrypt-media`).
    async fn fetch(&self, media_handle: &str, mime_type: &str) -> crate::error::Result<Vec<u8>>;
}

pub struct Dispatcher {
    shared: Arc<dyn SharedStore>,
    transcriber: Option<Arc<dyn Transcriber>>,
    image_describer: Option<Arc<dyn ImageDescriber>>,
}

impl Dispatcher {
    pub fn new(
        shared: Arc<dyn SharedStore>,
        transcriber: Option<Arc<dyn Transcriber>>,
        image_describer: Option<Arc<dyn ImageDescriber>>,
    ) -> Self {
        Self {
            shared,
            transcriber,
            image_describer,
        }
    }

    /// Computes the final dedup key, inserts it, resolves audio/image media,
    /// and returns the event ready for the Batcher — or `None` if this is a
    /// duplicate of an already-processed message.
    pub async fn dispatch(
        &self,
        media_fetcher: &dyn MediaFetcher,
        mut event: InboundEvent,
    ) -> Option<InboundEvent> {
        if event.message_id.is_empty() {
            event.message_id = content_hash(&event.agent_selector, &event.user_phone, &event.text);
        }
        let dedup_key = format!("{}:{}", event.agent_selector, event.message_id);
        if !self.shared.increment_dedup(&dedup_key, DEDUP_TTL) {
            return None;
        }

        match event.msg_type {
            InboundMsgType::Audio => self.resolve_audio(media_fetcher, &mut event).await,
            InboundMsgType::Image => self.resolve_image(media_fetcher, &mut event).await,
            _ => {}
        }

        Some(event)
    }

    async fn resolve_audio(&self, fetcher: &dyn MediaFetcher, event: &mut InboundEvent) {
        let (Some(handle), Some(transcriber)) = (event.media_handle.clone(), self.transcriber.as_ref()) else {
            return;
        };
        let mime = event.mime_type.clone().unwrap_or_default();
        let transcript = match fetcher.fetch(&handle, &mime).await {
            Ok(bytes) => transcriber.transcribe(&bytes, &mime).await,
            Err(e) => Err(e),
        };
        event.text = match transcript {
            Ok(text) => format!("[voice]: {text}"),
            Err(e) => {
                warn!(error = %e, "audio transcription failed");
                "[voice — could not transcribe]".to_string()
            }
        };
    }

    async fn resolve_image(&self, fetcher: &dyn MediaFetcher, event: &mut InboundEvent) {
        let (Some(handle), Some(describer)) = (event.media_handle.clone(), self.image_describer.as_ref()) else {
            return;
        };
        let mime = event.mime_type.clone().unwrap_or_default();
        let description = match fetcher.fetch(&handle, &mime).await {
            Ok(bytes) => describer.describe(&bytes, &mime).await,
            Err(e) => Err(e),
        };
        event.text = match description {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "image description failed");
                IMAGE_FAILURE_SENTINEL.to_string()
            }
        };
    }
}

fn content_hash(agent_selector: &str, sender: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_selector.as_bytes());
    hasher.update(b"|");
    hasher.update(sender.as_bytes());
    hasher.update(b"|");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::kv::DashMapStore;
    use wa_core::model::WhatsAppProvider;

    struct StubFetcher;

    #[async_trait::async_trait]
    impl MediaFetcher for StubFetcher {
        async fn fetch(&self, _media_handle: &str, _mime_type: &str) -> crate::error::Result<Vec<u8>> {
            Ok(vec![0u8; 4])
        }
    }

    struct StubTranscriber;
    #[async_trait::async_trait]
    impl Transcriber for StubTranscriber {
        async fn transcribe(&self, _audio_bytes: &[u8], _mime_type: &str) -> crate::error::Result<String> {
            Ok("hello there".to_string())
        }
    }

    struct FailingDescriber;
    #[async_trait::async_trait]
    impl ImageDescriber for FailingDescriber {
        async fn describe(&self, _image_bytes: &[u8], _mime_type: &str) -> crate::error::Result<String> {
            Err(crate::error::ProviderError::SendFailed("vision model down".into()))
        }
    }

    fn text_event(message_id: &str) -> InboundEvent {
        InboundEvent {
            provider: WhatsAppProvider::Meta,
            agent_selector: "1000".into(),
            user_phone: "972500000001".into(),
            user_display_name: None,
            msg_type: InboundMsgType::Text,
            text: "hi".into(),
            media_handle: None,
            mime_type: None,
            message_id: message_id.into(),
        }
    }

    #[tokio::test]
    async fn duplicate_message_id_is_dropped() {
        let shared: Arc<dyn SharedStore> = Arc::new(DashMapStore::new());
        let dispatcher = Dispatcher::new(shared, None, None);
        let fetcher = StubFetcher;
        let first = dispatcher.dispatch(&fetcher, text_event("wamid.1")).await;
        let second = dispatcher.dispatch(&fetcher, text_event("wamid.1")).await;
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn audio_without_message_id_is_hashed_and_transcribed() {
        let shared: Arc<dyn SharedStore> = Arc::new(DashMapStore::new());
        let dispatcher = Dispatcher::new(shared, Some(Arc::new(StubTranscriber)), None);
        let mut event = text_event("");
        event.msg_type = InboundMsgType::Audio;
        event.media_handle = Some("media-1".into());
        let fetcher = StubFetcher;
        let result = dispatcher.dispatch(&fetcher, event).await.unwrap();
        assert!(!result.message_id.is_empty());
        assert_eq!(result.text, "[voice]: hello there");
    }

    #[tokio::test]
    async fn image_description_failure_falls_back_to_sentinel() {
        let shared: Arc<dyn SharedStore> = Arc::new(DashMapStore::new());
        let dispatcher = Dispatcher::new(shared, None, Some(Arc::new(FailingDescriber)));
        let mut event = text_event("wamid.2");
        event.msg_type = InboundMsgType::Image;
        event.media_handle = Some("media-2".into());
        let fetcher = StubFetcher;
        let result = dispatcher.dispatch(&fetcher, event).await.unwrap();
        assert_eq!(result.text, IMAGE_FAILURE_SENTINEL);
    }
}
