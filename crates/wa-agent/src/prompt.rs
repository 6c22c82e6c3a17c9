//! System prompt assembly (§4.3): a cacheable block that's identical across
//! every turn for a given agent, plus a per-conversation user-info block and
//! an optional calendar block. Rendered as `SystemBlock`s so the provider
//! layer can mark the cacheable one with `cache_control`.

use std::sync::Arc;

use chrono::Utc;

use wa_core::model::{Agent, User};
use wa_core::time;
use wa_scheduler::SchedulerStore;
use wa_store::Store;

use crate::provider::SystemBlock;

/// Above this many active media items, the cacheable block stops enumerating
/// them individually and tells the model to use `search_media` instead —
/// keeps the cached block from growing unboundedly with a large catalog.
const MEDIA_INLINE_LIMIT: usize = 15;

const TOOL_USAGE_SUFFIX: &str = "\n\n## Using your tools\n\
Use search_knowledge and query_products before answering questions you aren't \
certain of. Always call check_availability before book_appointment. Never invent \
appointment ids, media ids, or product details — look them up. If the customer \
asks to stop hearing from you or to talk to a person, call opt_out_conversation.";

/// Builds the cacheable block: current date/time, the agent's system prompt,
/// the tool-usage suffix, and the business-knowledge and media sections.
/// Media lives in `SchedulerStore` rather than `Store`, so it's passed in
/// separately from the knowledge/product lookups.
pub fn build_cacheable_block(agent: &Agent, store: &Store, scheduler_store: &SchedulerStore) -> SystemBlock {
    let tz = agent.timezone_or_default();
    let now = Utc::now();
    let mut text = format!(
        "Current date/time: {} {} ({})\n\n{}",
        time::format_date_local(now, tz),
        time::format_time_local(now, tz),
        tz,
        agent.system_prompt,
    );
    text.push_str(TOOL_USAGE_SUFFIX);
    text.push_str(&build_knowledge_section(agent.id, store));
    text.push_str(&build_media_section(agent.id, scheduler_store));
    SystemBlock::cached(text)
}

fn build_knowledge_section(agent_id: i64, store: &Store) -> String {
    let topics = store.list_knowledge_topics(agent_id).unwrap_or_default();
    let products = store.query_products(agent_id, None, 50).unwrap_or_default();
    if topics.is_empty() && products.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\n## Business knowledge\n");
    if !topics.is_empty() {
        out.push_str("Knowledge base topics (use search_knowledge for details): ");
        out.push_str(&topics.join(", "));
        out.push('\n');
    }
    if !products.is_empty() {
        out.push_str(&format!(
            "{} products/services available (use query_products for details).\n",
            products.len()
        ));
    }
    out
}

fn build_media_section(agent_id: i64, scheduler_store: &SchedulerStore) -> String {
    let media = scheduler_store.list_active_media(agent_id).unwrap_or_default();
    if media.is_empty() {
        return String::new();
    }
    if media.len() > MEDIA_INLINE_LIMIT {
        return format!(
            "\n\n## Media\n{} media items are available. Use search_media to find the right one \
             before calling send_media.",
            media.len()
        );
    }
    let mut out = String::from("\n\n## Media\n");
    for m in &media {
        out.push_str(&format!("- {} (media_id: {})\n", m.display_name, m.media_id));
    }
    out
}

/// Builds the per-conversation user-info block: whatever's known about this
/// customer so the model doesn't have to re-ask.
pub fn build_user_info_block(user: &User) -> SystemBlock {
    let mut out = String::from("## Customer\n");
    if let Some(name) = &user.display_name {
        out.push_str(&format!("Name: {name}\n"));
    }
    if user.gender != wa_core::model::Gender::Unknown {
        out.push_str(&format!("Gender: {:?}\n", user.gender));
    }
    if let Some(obj) = user.metadata.as_object() {
        if !obj.is_empty() {
            out.push_str(&format!("Other known details: {}\n", user.metadata));
        }
    }
    SystemBlock::uncached(out)
}

/// Builds the optional calendar block when calendar is connected: the
/// agent's appointment instruction plus the customer's upcoming appointments
/// in local time. Per-weekday working hours are not rendered — `CalendarConfig`
/// carries no such field in this deployment (see DESIGN.md).
pub fn build_calendar_block(
    agent: &Agent,
    user_id: i64,
    scheduler_store: &Arc<SchedulerStore>,
) -> Option<SystemBlock> {
    if !agent.calendar.connected {
        return None;
    }
    let tz = agent.timezone_or_default();
    let mut out = String::from("## Calendar\n");
    if let Some(instruction) = &agent.calendar.appointment_instruction {
        out.push_str(instruction);
        out.push('\n');
    }
    let upcoming = scheduler_store.user_upcoming_appointments(agent.id, user_id).unwrap_or_default();
    if upcoming.is_empty() {
        out.push_str("This customer has no upcoming appointments.\n");
    } else {
        out.push_str("Upcoming appointments:\n");
        for a in &upcoming {
            let tz_dt = time::to_local(a.start, tz);
            out.push_str(&format!(
                "- #{} {} on {} ({}) at {}\n",
                a.id,
                a.title,
                time::format_date_local(a.start, tz),
                time::hebrew_weekday(tz_dt),
                time::format_time_local(a.start, tz),
            ));
        }
    }
    Some(SystemBlock::uncached(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn sample_agent() -> Agent {
        Agent {
            id: 1,
            name: "Bot".into(),
            active: true,
            provider: WhatsAppProvider::Meta,
            credentials: Default::default(),
            llm_model: "claude-3-5-sonnet".into(),
            custom_api_keys: Default::default(),
            system_prompt: "You help customers book haircuts.".into(),
            timezone: "Asia/Jerusalem".into(),
            batching: Default::default(),
            calendar: Default::default(),
            reminders: Default::default(),
            summaries: Default::default(),
            followups: Default::default(),
            media: Default::default(),
            context_summary: wa_core::model::ContextSummaryConfig {
                enabled: false,
                message_threshold: 30,
                messages_after_summary: 10,
                full_summary_every: 5,
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cacheable_block_includes_system_prompt_and_tool_suffix() {
        let store = Store::open_in_memory().unwrap();
        let scheduler_store = SchedulerStore::open_in_memory().unwrap();
        let block = build_cacheable_block(&sample_agent(), &store, &scheduler_store);
        assert!(block.cache);
        assert!(block.text.contains("You help customers book haircuts."));
        assert!(block.text.contains("check_availability"));
    }

    #[test]
    fn media_block_switches_to_search_hint_past_inline_limit() {
        let scheduler_store = SchedulerStore::open_in_memory().unwrap();
        for i in 0..20 {
            scheduler_store
                .upsert_media(1, &format!("m{i}"), "https://x", "image/png", "Item", None)
                .unwrap();
        }
        let section = build_media_section(1, &scheduler_store);
        assert!(section.contains("search_media"));
    }

    #[test]
    fn calendar_block_is_none_when_not_connected() {
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let block = build_calendar_block(&sample_agent(), 1, &scheduler_store);
        assert!(block.is_none());
    }
}
