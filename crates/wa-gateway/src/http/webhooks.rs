//! Inbound WhatsApp webhook ingress (C1): Meta's verify handshake + messages
//! envelope, and WaSender's per-agent event stream.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use wa_batcher::PendingMessage;
use wa_core::model::Agent;
use wa_providers::dispatcher::MediaFetcher;
use wa_providers::meta;
use wa_providers::types::InboundEvent;
use wa_providers::wasender;

use crate::app::AppState;
use crate::media::{GraphMediaFetcher, WaSenderMediaFetcher};

fn not_found_if_disabled(state: &AppState) -> Result<(), (StatusCode, Json<Value>)> {
    if state.webhooks_enabled {
        Ok(())
    } else {
        Err((StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))))
    }
}

#[derive(Debug, Deserialize)]
pub struct MetaVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhook — Meta's subscription handshake. Echoes the challenge back
/// if `hub.verify_token` matches any active agent's configured token.
pub async fn meta_verify_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetaVerifyQuery>,
) -> Result<String, StatusCode> {
    not_found_if_disabled(&state).map_err(|_| StatusCode::NOT_FOUND)?;

    let (Some(mode), Some(token), Some(challenge)) = (query.mode, query.verify_token, query.challenge) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let agents = state.store.list_active_agents().map_err(|e| {
        warn!(error = %e, "failed to list agents for webhook verification");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let known_tokens = agents
        .iter()
        .filter_map(|a| a.credentials.meta.as_ref())
        .map(|c| c.verify_token.as_str());

    match meta::verify_challenge(&mode, &token, &challenge, known_tokens) {
        Some(echoed) => Ok(echoed.to_string()),
        None => Err(StatusCode::FORBIDDEN),
    }
}

/// POST /webhook — Meta's messages envelope. Resolves each message's
/// `phone_number_id` to an agent, dispatches media, and hands the result to
/// the batcher.
pub async fn meta_webhook_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    not_found_if_disabled(&state)?;

    let parsed = meta::parse_webhook_envelope(&body).map_err(|e| {
        warn!(error = %e, "malformed meta webhook payload");
        (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed payload"})))
    })?;

    for item in parsed {
        let agent = match state.store.find_agent_by_phone_number_id(&item.phone_number_id) {
            Ok(Some(a)) => a,
            Ok(None) => {
                warn!(phone_number_id = %item.phone_number_id, "no agent configured for this phone number");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "agent lookup failed");
                continue;
            }
        };
        handle_inbound(&state, &agent, item.event).await;
    }

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct WasenderEventBody {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// POST /webhook/wasender/{agent_id} — one WaSender session per agent.
pub async fn wasender_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<WasenderEventBody>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    not_found_if_disabled(&state)?;

    let agent = state.store.get_agent(agent_id).map_err(|e| {
        warn!(agent_id, error = %e, "unknown agent for wasender webhook");
        (StatusCode::NOT_FOUND, Json(json!({"error": "unknown agent"})))
    })?;

    let creds = agent.credentials.wasender.as_ref().ok_or_else(|| {
        (StatusCode::BAD_REQUEST, Json(json!({"error": "agent has no wasender credentials"})))
    })?;

    let signature = headers.get("x-webhook-signature").and_then(|v| v.to_str().ok());
    wasender::verify_signature(signature, &creds.webhook_secret).map_err(|e| {
        warn!(agent_id, error = %e, "wasender signature verification failed");
        (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid signature"})))
    })?;

    let Some(mut event) = wasender::parse_webhook_event(&body.event, &body.data) else {
        return Ok(StatusCode::OK);
    };
    event.agent_selector = agent_id.to_string();

    handle_inbound(&state, &agent, event).await;
    Ok(StatusCode::OK)
}

/// Shared tail of both webhook handlers: build the provider-appropriate
/// media fetcher, dispatch (dedup + transcription/description), and enqueue
/// with the Batcher (C2).
async fn handle_inbound(state: &Arc<AppState>, agent: &Agent, event: InboundEvent) {
    let fetcher: Box<dyn MediaFetcher> = match agent.provider {
        wa_core::model::WhatsAppProvider::Meta => match &agent.credentials.meta {
            Some(creds) => Box::new(GraphMediaFetcher::new(reqwest::Client::new(), creds.clone())),
            None => {
                warn!(agent_id = agent.id, "meta agent has no credentials, dropping inbound media event");
                return;
            }
        },
        wa_core::model::WhatsAppProvider::Wasender => match &agent.credentials.wasender {
            Some(creds) => Box::new(WaSenderMediaFetcher::new(reqwest::Client::new(), creds.clone())),
            None => {
                warn!(agent_id = agent.id, "wasender agent has no credentials, dropping inbound media event");
                return;
            }
        },
    };

    let Some(resolved) = state.dispatcher.dispatch(fetcher.as_ref(), event).await else {
        info!(agent_id = agent.id, "dropped duplicate inbound message");
        return;
    };

    let user_phone = resolved.user_phone.clone();
    let message = PendingMessage {
        text: resolved.text,
        media_id: resolved.media_handle,
        media_url: None,
    };

    state
        .batcher
        .add(agent.id, &user_phone, message, agent.batching.debounce_seconds, agent.batching.max_batch_messages)
        .await;
}
