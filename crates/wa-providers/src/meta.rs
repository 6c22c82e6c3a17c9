//! Meta WhatsApp Cloud API adapter: webhook verify/parse plus Graph v22.0
//! outbound sends.

use async_trait::async_trait;
use serde_json::{json, Value};

use wa_core::model::MetaCredentials;

use crate::error::{ProviderError, Result};
use crate::types::{InboundEvent, InboundMsgType, OutboundContent};
use crate::traits::WhatsAppSender;

const GRAPH_BASE: &str = "https://graph.facebook.com/v22.0";

/// `GET /webhook` verify handshake: echo the challenge back only if
/// `hub.verify_token` matches any configured agent's token.
pub fn verify_challenge<'a>(
    mode: &str,
    token: &str,
    challenge: &'a str,
    known_tokens: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    if mode != "subscribe" {
        return None;
    }
    if known_tokens.into_iter().any(|t| t == token) {
        Some(challenge)
    } else {
        None
    }
}

/// One parsed message extracted from `entry[].changes[].value.messages[]`.
pub struct ParsedMetaMessage {
    pub phone_number_id: String,
    pub event: InboundEvent,
}

/// Parse the standard Meta v22.0 messages envelope. A single POST body can
/// carry multiple entries/changes/messages; all are returned.
pub fn parse_webhook_envelope(body: &Value) -> Result<Vec<ParsedMetaMessage>> {
    let mut out = Vec::new();
    let entries = body
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedPayload("missing entry[]".into()))?;

    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(Value::as_array) else {
            continue;
        };
        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let phone_number_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let Some(messages) = value.get("messages").and_then(Value::as_array) else {
                continue;
            };
            let contact_name = value
                .get("contacts")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|c| c.get("profile"))
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);

            for msg in messages {
                if let Some(event) = parse_single_message(msg, &phone_number_id, contact_name.clone()) {
                    out.push(ParsedMetaMessage {
                        phone_number_id: phone_number_id.clone(),
                        event,
                    });
                }
            }
        }
    }
    Ok(out)
}

fn parse_single_message(
    msg: &Value,
    phone_number_id: &str,
    contact_name: Option<String>,
) -> Option<InboundEvent> {
    let from = msg.get("from").and_then(Value::as_str)?.to_string();
    let message_id = msg.get("id").and_then(Value::as_str)?.to_string();
    let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or("unknown");

    let (kind, text, media_handle, mime_type) = match msg_type {
        "text" => {
            let body = msg
                .get("text")
                .and_then(|t| t.get("body"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (InboundMsgType::Text, body, None, None)
        }
        "audio" => {
            let id = msg.get("audio").and_then(|a| a.get("id")).and_then(Value::as_str);
            let mime = msg.get("audio").and_then(|a| a.get("mime_type")).and_then(Value::as_str);
            (
                InboundMsgType::Audio,
                String::new(),
                id.map(str::to_string),
                mime.map(str::to_string),
            )
        }
        "image" => {
            let id = msg.get("image").and_then(|a| a.get("id")).and_then(Value::as_str);
            let mime = msg.get("image").and_then(|a| a.get("mime_type")).and_then(Value::as_str);
            (
                InboundMsgType::Image,
                String::new(),
                id.map(str::to_string),
                mime.map(str::to_string),
            )
        }
        _ => (InboundMsgType::Other, String::new(), None, None),
    };

    Some(InboundEvent {
        provider: wa_core::model::WhatsAppProvider::Meta,
        agent_selector: phone_number_id.to_string(),
        user_phone: from,
        user_display_name: contact_name,
        msg_type: kind,
        text,
        media_handle,
        mime_type,
        message_id,
    })
}

/// Graph API sender for a single agent's phone number.
pub struct MetaSender {
    client: reqwest::Client,
    credentials: MetaCredentials,
}

impl MetaSender {
    pub fn new(client: reqwest::Client, credentials: MetaCredentials) -> Self {
        Self { client, credentials }
    }

    fn messages_url(&self) -> String {
        format!("{GRAPH_BASE}/{}/messages", self.credentials.phone_number_id)
    }

    async fn post(&self, payload: Value) -> Result<()> {
        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.credentials.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthFailed(format!("graph returned {status}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited { retry_after_secs: 30 });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::SendFailed(format!("graph {status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl WhatsAppSender for MetaSender {
    async fn send(&self, to_phone: &str, content: OutboundContent<'_>) -> Result<()> {
        let payload = match content {
            OutboundContent::Text(text) => json!({
                "messaging_product": "whatsapp",
                "to": to_phone,
                "type": "text",
                "text": { "body": text },
            }),
            OutboundContent::Image { url, caption } => json!({
                "messaging_product": "whatsapp",
                "to": to_phone,
                "type": "image",
                "image": { "link": url, "caption": caption },
            }),
            OutboundContent::Video { url, caption } => json!({
                "messaging_product": "whatsapp",
                "to": to_phone,
                "type": "video",
                "video": { "link": url, "caption": caption },
            }),
            OutboundContent::Document { url, filename, caption } => json!({
                "messaging_product": "whatsapp",
                "to": to_phone,
                "type": "document",
                "document": { "link": url, "filename": filename, "caption": caption },
            }),
            OutboundContent::Template { name, language, body_params } => {
                let parameters: Vec<Value> = body_params
                    .iter()
                    .map(|p| json!({ "type": "text", "text": p }))
                    .collect();
                json!({
                    "messaging_product": "whatsapp",
                    "to": to_phone,
                    "type": "template",
                    "template": {
                        "name": name,
                        "language": { "code": language },
                        "components": [{ "type": "body", "parameters": parameters }],
                    },
                })
            }
        };
        self.post(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_challenge_matches_known_token() {
        let tokens = vec!["secret-a", "secret-b"];
        let result = verify_challenge("subscribe", "secret-b", "12345", tokens.into_iter());
        assert_eq!(result, Some("12345"));
    }

    #[test]
    fn verify_challenge_rejects_unknown_token() {
        let tokens = vec!["secret-a"];
        let result = verify_challenge("subscribe", "wrong", "12345", tokens.into_iter());
        assert_eq!(result, None);
    }

    #[test]
    fn parse_envelope_extracts_text_message() {
        let body = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": "1000" },
                        "contacts": [{ "profile": { "name": "Dana" } }],
                        "messages": [{
                            "from": "972500000001",
                            "id": "wamid.abc",
                            "type": "text",
                            "text": { "body": "hi there" },
                        }],
                    }
                }]
            }]
        });
        let parsed = parse_webhook_envelope(&body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event.text, "hi there");
        assert_eq!(parsed[0].event.user_display_name.as_deref(), Some("Dana"));
        assert_eq!(parsed[0].phone_number_id, "1000");
    }

    #[test]
    fn parse_envelope_ignores_entries_without_messages() {
        let body = json!({ "entry": [{ "changes": [{ "value": { "statuses": [] } }] }] });
        let parsed = parse_webhook_envelope(&body).unwrap();
        assert!(parsed.is_empty());
    }
}
