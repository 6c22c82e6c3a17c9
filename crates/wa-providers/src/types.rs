use serde::{Deserialize, Serialize};
use wa_core::model::WhatsAppProvider;

/// Inbound message type, after the provider-specific envelope is normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundMsgType {
    Text,
    Audio,
    Image,
    Other,
}

/// Common shape every provider adapter normalizes its webhook envelope into.
///
/// This is what C1 hands to the Batcher once dedup and media resolution have
/// run — the rest of the pipeline (C2 onward) never sees a provider-specific
/// payload again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub provider: WhatsAppProvider,
    /// How the sending agent is identified in the raw payload (Meta:
    /// `phone_number_id`; WaSender: the path's `agent_id`).
    pub agent_selector: String,
    pub user_phone: String,
    pub user_display_name: Option<String>,
    pub msg_type: InboundMsgType,
    pub text: String,
    pub media_handle: Option<String>,
    pub mime_type: Option<String>,
    /// Provider message id (Meta) or a content hash (WaSender text), used as
    /// the dedup key together with `agent_selector`.
    pub message_id: String,
}

/// Content of an outbound send, provider-agnostic.
#[derive(Debug, Clone)]
pub enum OutboundContent<'a> {
    Text(&'a str),
    Image { url: &'a str, caption: Option<&'a str> },
    Video { url: &'a str, caption: Option<&'a str> },
    Document { url: &'a str, filename: &'a str, caption: Option<&'a str> },
    Template {
        name: &'a str,
        language: &'a str,
        body_params: &'a [String],
    },
}
