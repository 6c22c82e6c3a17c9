//! Context-Summary Engine (C6): rolls the conversation's history into a
//! `ConversationContextSummary` so the orchestrator can keep prompting a
//! long-running conversation without ever sending the full transcript.

use std::time::Duration as StdDuration;

use tracing::{info, warn};

use wa_core::kv::Claim;
use wa_core::model::{Agent, Message, MessageRole};

use crate::provider::{ChatRequest, Message as LlmMessage, SystemBlock};

use super::context::Orchestrator;

/// §4.3's "approaches the model's safe token limit" heuristic: conservative
/// 3 chars/token, compared against 90% of this assumed ceiling. The config
/// carries no per-model ceiling (see DESIGN.md), so a single conservative
/// constant stands in for every provider.
const ASSUMED_MODEL_CEILING_TOKENS: usize = 200_000;
const CHARS_PER_TOKEN: usize = 3;
const FULL_SUMMARY_MESSAGE_CAP: i64 = 200;
const CONTEXT_LOCK_TTL: StdDuration = StdDuration::from_secs(300);

const SUMMARIZER_SYSTEM_PROMPT: &str = "You summarize a customer-support WhatsApp conversation for the \
assistant's own later reference. Write a dense, factual summary covering: who the customer is, what \
they've asked for, what's been promised or booked, and anything still open. Omit small talk. Output \
plain text, no headers, no markdown.";

/// Called after persisting an assistant reply when `agent.context_summary.enabled`.
/// Runs under the per-conversation lock so two scheduler/orchestrator
/// instances never summarize the same conversation concurrently.
pub async fn maybe_run_context_summary(orch: &Orchestrator, agent: &Agent, conversation_id: i64) {
    let lock_key = conversation_id.to_string();
    if orch.shared.acquire_conv_lease(&lock_key, CONTEXT_LOCK_TTL) == Claim::HeldByOther {
        return;
    }

    if let Err(e) = run(orch, agent, conversation_id).await {
        warn!(conversation_id, error = %e, "context summary run failed");
    }
}

async fn run(orch: &Orchestrator, agent: &Agent, conversation_id: i64) -> crate::error::Result<()> {
    let existing = orch.scheduler_store.get_context_summary(conversation_id)?;
    let last_covered = existing.as_ref().map(|s| s.last_message_id_covered).unwrap_or(0);
    let incremental_count = existing.as_ref().map(|s| s.incremental_count).unwrap_or(0);

    let uncovered = orch.store.messages_after(conversation_id, last_covered)?;
    if uncovered.is_empty() {
        return Ok(());
    }

    let prior_summary_len = existing.as_ref().map(|s| s.summary.len()).unwrap_or(0);
    let estimated_tokens = (prior_summary_len + transcript_len(&uncovered) + 2_000) / CHARS_PER_TOKEN;
    let threshold_hit = uncovered.len() as i64 >= agent.context_summary.message_threshold;
    let budget_hit = estimated_tokens >= ASSUMED_MODEL_CEILING_TOKENS * 9 / 10;
    if !threshold_hit && !budget_hit {
        return Ok(());
    }

    // Every `full_summary_every`-th run is full; the very first run (no
    // existing summary row) is trivially full since there's nothing to
    // build on incrementally.
    let is_full = existing.is_none()
        || (agent.context_summary.full_summary_every > 0
            && (incremental_count + 1) % agent.context_summary.full_summary_every == 0);

    let (messages_for_prompt, new_last_covered) = if is_full {
        let recent = orch.store.recent_messages(conversation_id, FULL_SUMMARY_MESSAGE_CAP)?;
        let max_id = recent.iter().map(|m| m.id).max().unwrap_or(last_covered);
        (recent, max_id)
    } else {
        let max_id = uncovered.iter().map(|m| m.id).max().unwrap_or(last_covered);
        (uncovered, max_id)
    };

    let transcript = render_transcript(&messages_for_prompt);
    let mut prompt = String::new();
    if let Some(summary) = &existing {
        if !is_full {
            prompt.push_str("Existing summary:\n");
            prompt.push_str(&summary.summary);
            prompt.push_str("\n\nNew messages since that summary:\n");
        }
    }
    prompt.push_str(&transcript);

    let request = ChatRequest {
        model: agent.llm_model.clone(),
        system_blocks: vec![SystemBlock::uncached(SUMMARIZER_SYSTEM_PROMPT)],
        messages: vec![LlmMessage::user_text(prompt)],
        tools: Vec::new(),
        max_tokens: 1024,
    };

    let outcome = orch.runtime.run_turn(agent, request, &[]).await?;
    let summary_text = outcome.response.text();
    if summary_text.trim().is_empty() {
        return Ok(());
    }

    let new_incremental_count = if is_full { 0 } else { incremental_count + 1 };
    orch.scheduler_store.upsert_context_summary(conversation_id, &summary_text, new_last_covered, new_incremental_count)?;

    info!(conversation_id, is_full, new_last_covered, "context summary updated");
    Ok(())
}

fn transcript_len(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.len()).sum()
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let who = match m.role {
                MessageRole::User => "customer",
                MessageRole::Assistant => "assistant",
            };
            format!("{who}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
