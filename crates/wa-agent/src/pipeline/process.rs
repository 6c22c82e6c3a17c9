//! The turn itself (§4.3): identity resolution, history/prompt assembly,
//! the tool loop, outbound send, and the bookkeeping that follows a reply
//! (token usage, follow-up timer arming, context-summary trigger).

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use wa_batcher::PendingMessage;
use wa_core::model::{Agent, Conversation, MessageContentType, MessageRole};
use wa_providers::traits::WhatsAppSender;
use wa_providers::types::OutboundContent;
use wa_store::messages::NewMessage;

use crate::error::Result;
use crate::provider::{Block, ChatRequest, Message, Role};
use crate::tools;

use super::context::Orchestrator;

/// Mirrors `wa_scheduler::engine`'s private constant of the same name — both
/// sides of the timer sorted-set must agree on the key. Arming the first
/// step's timer is the orchestrator's job; draining and chaining the rest
/// belongs to `SchedulerEngine`.
const FOLLOWUP_TIMER_SET: &str = "followup:timers";

pub(crate) async fn handle_batch(
    orch: &Orchestrator,
    agent_id: i64,
    user_phone: &str,
    messages: Vec<PendingMessage>,
) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }

    let agent = orch.store.get_agent(agent_id)?;
    let now = Utc::now();

    // 1. load/create user + conversation.
    let resolved = orch.resolver.resolve(agent_id, user_phone)?;
    let conversation = resolved.conversation;

    // 2 & 3. (I2) clear opted_out, bump last_customer_message_at, cancel
    // any in-flight follow-up sequence — a customer reply always wins.
    orch.resolver.mark_inbound(conversation.id, now)?;
    let cancelled = orch.scheduler_store.cancel_pending_followups(conversation.id)?;
    if cancelled > 0 {
        // Whichever step's timer is currently live, it's for this
        // conversation — remove all possible step members rather than
        // tracking which one is outstanding.
        for step_number in 1..=agent.followups.sequence.len() {
            orch.shared
                .remove_timer(FOLLOWUP_TIMER_SET, &format!("{}:{step_number}", conversation.id));
        }
    }

    // 4. persist each inbound message (voice/image already resolved to text
    // surrogates upstream, in the dispatcher).
    for m in &messages {
        let content_type = if m.media_id.is_some() { MessageContentType::Media } else { MessageContentType::Text };
        orch.store.append_message(NewMessage {
            conversation_id: conversation.id,
            role: MessageRole::User,
            content_type,
            content: &m.text,
            media_id: m.media_id.as_deref(),
            media_url: m.media_url.as_deref(),
        })?;
    }

    // 5. paused conversations never reach the model.
    let conversation = orch.store.get_conversation(conversation.id)?;
    if conversation.paused {
        info!(conversation_id = conversation.id, "conversation paused, skipping AI turn");
        return Ok(());
    }

    // 6. build context and invoke the LLM.
    let user = orch.store.get_user(conversation.user_id)?;
    let history = build_history(orch, &conversation)?;

    let mut system_blocks = vec![crate::prompt::build_cacheable_block(&agent, &orch.store, &orch.scheduler_store)];
    system_blocks.push(crate::prompt::build_user_info_block(&user));
    if let Some(calendar_block) = crate::prompt::build_calendar_block(&agent, conversation.user_id, &orch.scheduler_store) {
        system_blocks.push(calendar_block);
    }

    let tool_list = tools::build_all(
        Arc::clone(&orch.store),
        Arc::clone(&orch.scheduler_store),
        Arc::new(agent.clone()),
        conversation.user_id,
        conversation.id,
    );

    let mut llm_messages = history;
    llm_messages.push(pending_batch_as_message(&messages));

    let request = ChatRequest {
        model: agent.llm_model.clone(),
        system_blocks,
        messages: llm_messages,
        tools: tools::to_definitions(&tool_list),
        max_tokens: 4096,
    };

    let outcome = orch.runtime.run_turn(&agent, request, &tool_list).await?;

    // 9. token usage, accounted regardless of whether a reply was produced.
    orch.store.add_token_usage(agent.id, outcome.response.usage.input_tokens, outcome.response.usage.output_tokens)?;

    // 7. persist + 8. send the assistant reply and any media directives.
    let reply_text = outcome.response.text();
    if !reply_text.trim().is_empty() {
        orch.store.append_message(NewMessage {
            conversation_id: conversation.id,
            role: MessageRole::Assistant,
            content_type: MessageContentType::Text,
            content: &reply_text,
            media_id: None,
            media_url: None,
        })?;
    }

    let sender = orch.senders.sender_for(&agent)?;
    if !reply_text.trim().is_empty() {
        if let Err(e) = sender.send(&user.phone, OutboundContent::Text(&reply_text)).await {
            warn!(conversation_id = conversation.id, error = %e, "failed to send assistant reply");
        }
    }

    send_media_actions(orch, &agent, &conversation, &sender, outcome.media_actions).await;

    // Arm the first follow-up timer: only once the customer has spoken
    // (`last_customer_message_at` is set by `mark_inbound` above) and the
    // agent has a configured sequence.
    if agent.followups.enabled && !agent.followups.sequence.is_empty() && !reply_text.trim().is_empty() {
        if let Some(step) = agent.followups.sequence.first() {
            let fire_at = now + Duration::seconds((step.delay_hours * 3600.0) as i64);
            let member = format!("{}:1", conversation.id);
            orch.shared.enqueue_timer(FOLLOWUP_TIMER_SET, &member, fire_at.timestamp());
        }
    }

    // Context-summary trigger (§4.6): only worth checking when something
    // was actually said back.
    if agent.context_summary.enabled && !reply_text.trim().is_empty() {
        super::compact::maybe_run_context_summary(orch, &agent, conversation.id).await;
    }

    Ok(())
}

/// History selection (§4.3): summary-backed turns when a
/// `ConversationContextSummary` exists, otherwise the last
/// `messages_after_summary`-sized raw window. The current batch is excluded
/// — it's appended separately as the pending user turn.
const DEFAULT_MAX_HISTORY_MESSAGES: i64 = 40;

fn build_history(orch: &Orchestrator, conversation: &Conversation) -> Result<Vec<Message>> {
    if let Some(summary) = orch.scheduler_store.get_context_summary(conversation.id)? {
        let mut out = vec![
            Message::user_text(format!("[conversation summary so far]\n{}", summary.summary)),
            Message::assistant_text("Understood, I have the context."),
        ];
        let after = orch.store.messages_after(conversation.id, summary.last_message_id_covered)?;
        out.extend(after.iter().map(store_message_to_llm));
        return Ok(out);
    }

    let recent = orch.store.recent_messages(conversation.id, DEFAULT_MAX_HISTORY_MESSAGES)?;
    Ok(recent.iter().map(store_message_to_llm).collect())
}

fn store_message_to_llm(m: &wa_core::model::Message) -> Message {
    match m.role {
        MessageRole::User => Message::user_text(m.content.clone()),
        MessageRole::Assistant => Message::assistant_text(m.content.clone()),
    }
}

fn pending_batch_as_message(messages: &[PendingMessage]) -> Message {
    let blocks: Vec<Block> = messages.iter().map(|m| Block::text(m.text.clone())).collect();
    Message { role: Role::User, blocks }
}

/// Media actions (§4.3): dedupe by media id within this batch, cap at
/// `media.max_per_message`, send each, and record an assistant `media`
/// message for every successful send.
async fn send_media_actions(
    orch: &Orchestrator,
    agent: &Agent,
    conversation: &Conversation,
    sender: &Arc<dyn WhatsAppSender>,
    actions: Vec<serde_json::Value>,
) {
    let mut seen = std::collections::HashSet::new();
    let mut sent = 0usize;
    for action in actions {
        if sent >= agent.media.max_per_message {
            break;
        }
        let Some(media_id) = action.get("media_id").and_then(|v| v.as_str()) else { continue };
        if !seen.insert(media_id.to_string()) {
            continue;
        }
        if action.get("already_sent").and_then(|v| v.as_bool()).unwrap_or(false) {
            continue;
        }
        let Some(url) = action.get("url").and_then(|v| v.as_str()) else { continue };
        let caption = action.get("caption").and_then(|v| v.as_str());
        let mime_type = action.get("mime_type").and_then(|v| v.as_str()).unwrap_or("");

        let content = if mime_type.starts_with("image/") {
            OutboundContent::Image { url, caption }
        } else if mime_type.starts_with("video/") {
            OutboundContent::Video { url, caption }
        } else {
            OutboundContent::Document { url, filename: media_id, caption }
        };

        let user = match orch.store.get_user(conversation.user_id) {
            Ok(u) => u,
            Err(_) => continue,
        };

        match sender.send(&user.phone, content).await {
            Ok(()) => {
                let _ = orch.store.append_message(NewMessage {
                    conversation_id: conversation.id,
                    role: MessageRole::Assistant,
                    content_type: MessageContentType::Media,
                    content: caption.unwrap_or(""),
                    media_id: Some(media_id),
                    media_url: Some(url),
                });
                sent += 1;
            }
            Err(e) => warn!(conversation_id = conversation.id, media_id, error = %e, "failed to send media"),
        }
    }
}
