//! WaSender adapter: string-equal webhook secret check, `fromMe`/group
//! filtering, sender-field fallback chain, and `/send-message` outbound.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

use wa_core::model::WasenderCredentials;

use crate::error::{ProviderError, Result};
use crate::traits::WhatsAppSender;
use crate::types::{InboundEvent, InboundMsgType, OutboundContent};

/// String-equal comparison — WaSender's webhook secret is not an HMAC digest,
/// it's the shared secret sent back verbatim in `X-Webhook-Signature`.
pub fn verify_signature(header_value: Option<&str>, configured_secret: &str) -> Result<()> {
    match header_value {
        None => Ok(()),
        Some(v) if v == configured_secret => Ok(()),
        Some(_) => Err(ProviderError::InvalidSignature(
            "X-Webhook-Signature did not match the configured secret".into(),
        )),
    }
}

/// `cleanedSenderPn → senderPn → participant → remoteJid`, in that order.
fn resolve_sender(payload: &Value) -> Option<String> {
    for key in ["cleanedSenderPn", "senderPn", "participant", "remoteJid"] {
        if let Some(v) = payload.get(key).and_then(Value::as_str) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Keep only [10,15]-digit phone numbers, stripping any `@s.whatsapp.net` /
/// `@g.us` suffix first. Group and broadcast JIDs (`@g.us`, `status@broadcast`)
/// are rejected here since their digit prefix won't satisfy the length check
/// once non-digit JIDs are present, but we also reject explicitly.
fn normalize_and_validate_phone(raw: &str) -> Option<String> {
    if raw.ends_with("@g.us") || raw.contains("broadcast") {
        return None;
    }
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 10 && digits.len() <= 15 {
        Some(digits)
    } else {
        None
    }
}

/// Parse one WaSender webhook event (`messages.received`, `messages.upsert`,
/// `messages-personal.received`). `fromMe` echoes and unparseable sender
/// fields return `None`.
pub fn parse_webhook_event(event_type: &str, payload: &Value) -> Option<InboundEvent> {
    if !matches!(
        event_type,
        "messages.received" | "messages.upsert" | "messages-personal.received"
    ) {
        return None;
    }

    let msg = payload.get("messages").unwrap_or(payload);
    if msg.get("key").and_then(|k| k.get("fromMe")).and_then(Value::as_bool) == Some(true) {
        return None;
    }

    let key = msg.get("key").unwrap_or(msg);
    let sender_raw = resolve_sender(key).or_else(|| resolve_sender(msg))?;
    let user_phone = normalize_and_validate_phone(&sender_raw)?;

    let message_id = msg
        .get("key")
        .and_then(|k| k.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let text = msg
        .get("message")
        .and_then(|m| m.get("conversation"))
        .and_then(Value::as_str)
        .or_else(|| {
            msg.get("message")
                .and_then(|m| m.get("extendedTextMessage"))
                .and_then(|e| e.get("text"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string();

    let display_name = msg
        .get("pushName")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(InboundEvent {
        provider: wa_core::model::WhatsAppProvider::Wasender,
        agent_selector: String::new(),
        user_phone,
        user_display_name: display_name,
        msg_type: if text.is_empty() { InboundMsgType::Other } else { InboundMsgType::Text },
        text,
        media_handle: None,
        mime_type: None,
        message_id,
    })
}

pub struct WaSenderSender {
    client: reqwest::Client,
    credentials: WasenderCredentials,
    base_url: String,
}

impl WaSenderSender {
    pub fn new(client: reqwest::Client, credentials: WasenderCredentials) -> Self {
        Self {
            client,
            credentials,
            base_url: "https://www.wasenderapi.com/api".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post_with_backoff(&self, path: &str, payload: Value) -> Result<()> {
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .client
                .post(format!("{}{path}", self.base_url))
                .bearer_auth(&self.credentials.api_key)
                .json(&payload)
                .send()
                .await
                .map_err(|e| ProviderError::SendFailed(e.to_string()))?;

            let status = resp.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_ATTEMPTS {
                    return Err(ProviderError::RateLimited {
                        retry_after_secs: 2 * attempt as u64,
                    });
                }
                sleep(Duration::from_secs(2 * attempt as u64)).await;
                continue;
            }
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ProviderError::AuthFailed(format!("wasender returned {status}")));
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ProviderError::SendFailed(format!("wasender {status}: {body}")));
            }
            return Ok(());
        }
        unreachable!("loop always returns inside the match arms above")
    }
}

#[async_trait]
impl WhatsAppSender for WaSenderSender {
    async fn send(&self, to_phone: &str, content: OutboundContent<'_>) -> Result<()> {
        let payload = match content {
            OutboundContent::Text(text) => json!({
                "to": to_phone,
                "text": text,
                "session": self.credentials.session,
            }),
            OutboundContent::Image { url, caption } => json!({
                "to": to_phone,
                "imageUrl": url,
                "text": caption,
                "session": self.credentials.session,
            }),
            OutboundContent::Video { url, caption } => json!({
                "to": to_phone,
                "videoUrl": url,
                "text": caption,
                "session": self.credentials.session,
            }),
            OutboundContent::Document { .. } | OutboundContent::Template { .. } => {
                return Err(ProviderError::ConfigError(
                    "wasender does not support document or template sends".into(),
                ));
            }
        };
        self.post_with_backoff("/send-message", payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_signature_accepts_matching_secret() {
        assert!(verify_signature(Some("abc123"), "abc123").is_ok());
    }

    #[test]
    fn verify_signature_rejects_mismatch() {
        assert!(verify_signature(Some("wrong"), "abc123").is_err());
    }

    #[test]
    fn verify_signature_allows_missing_header() {
        assert!(verify_signature(None, "abc123").is_ok());
    }

    #[test]
    fn from_me_echo_is_dropped() {
        let payload = json!({
            "key": { "fromMe": true, "remoteJid": "972500000001@s.whatsapp.net" },
            "message": { "conversation": "echo" },
        });
        assert!(parse_webhook_event("messages.upsert", &payload).is_none());
    }

    #[test]
    fn group_jid_is_rejected() {
        let payload = json!({
            "key": { "remoteJid": "120363000000000000@g.us" },
            "message": { "conversation": "hi" },
        });
        assert!(parse_webhook_event("messages.upsert", &payload).is_none());
    }

    #[test]
    fn valid_personal_message_resolves_sender_chain() {
        let payload = json!({
            "key": { "senderPn": "972500000001@s.whatsapp.net" },
            "pushName": "Ben",
            "message": { "conversation": "hello" },
        });
        let event = parse_webhook_event("messages-personal.received", &payload).unwrap();
        assert_eq!(event.user_phone, "972500000001");
        assert_eq!(event.text, "hello");
        assert_eq!(event.user_display_name.as_deref(), Some("Ben"));
    }

    #[test]
    fn out_of_range_digit_count_is_rejected() {
        assert_eq!(normalize_and_validate_phone("12345"), None);
        assert_eq!(normalize_and_validate_phone("972500000001"), Some("972500000001".into()));
    }
}
