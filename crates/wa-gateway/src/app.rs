//! Central shared state (C7's `SchedulerSink` implementor) and the Axum
//! router. One `Arc<AppState>` is threaded through every handler and
//! through the `SchedulerEngine` this process spawns.

use std::sync::Arc;

use axum::{routing::get, Router};
use chrono::{Duration, Utc};
use tracing::warn;

use wa_agent::factory::ProviderFactory;
use wa_agent::pipeline::Orchestrator;
use wa_agent::runtime::AgentRuntime;
use wa_agent::sender::SenderFactory;
use wa_agent::{Block, ChatRequest, Message, Role, SystemBlock};
use wa_core::kv::SharedStore;
use wa_core::model::{
    Agent, Appointment, ReminderContentType, ScheduledFollowup, ScheduledReminder, SentVia, User,
    WhatsAppProvider,
};
use wa_core::time::{format_date_local, format_time_local, hebrew_weekday, to_local, ActiveHours};
use wa_providers::dispatcher::Dispatcher;
use wa_providers::types::OutboundContent;
use wa_scheduler::engine::{FollowupOutcome, SchedulerSink};
use wa_scheduler::SchedulerStore;
use wa_store::Store;
use wa_users::ConversationResolver;

use crate::vision::LlmImageDescriber;

const DEFAULT_REMINDER_PROMPT: &str =
    "Write a brief, friendly appointment reminder message in the customer's language.";
const FOLLOWUP_DECISION_SUFFIX: &str = "\n\nRespond with strict JSON only, no surrounding prose: \
{\"action\": \"send\" or \"skip\", \"content\": \"<message text, only if sending>\", \"reason\": \"<why>\"}.";

pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler_store: Arc<SchedulerStore>,
    pub shared: Arc<dyn SharedStore>,
    pub runtime: Arc<AgentRuntime>,
    pub senders: Arc<SenderFactory>,
    pub orchestrator: Arc<Orchestrator>,
    pub batcher: Arc<wa_batcher::Batcher<Orchestrator>>,
    pub factory: Arc<ProviderFactory>,
    pub dispatcher: Arc<Dispatcher>,
    pub webhooks_enabled: bool,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        scheduler_store: Arc<SchedulerStore>,
        shared: Arc<dyn SharedStore>,
        runtime: Arc<AgentRuntime>,
        senders: Arc<SenderFactory>,
        resolver: Arc<ConversationResolver>,
        factory: Arc<ProviderFactory>,
        webhooks_enabled: bool,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&scheduler_store),
            resolver,
            Arc::clone(&runtime),
            Arc::clone(&senders),
            Arc::clone(&shared),
        ));
        let batcher = wa_batcher::Batcher::new(Arc::clone(&shared), Arc::clone(&orchestrator));
        let image_describer = Arc::new(LlmImageDescriber::new(Arc::clone(&factory)));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&shared), None, Some(image_describer)));
        Self {
            store,
            scheduler_store,
            shared,
            runtime,
            senders,
            orchestrator,
            batcher,
            factory,
            dispatcher,
            webhooks_enabled,
        }
    }

    async fn generate_ai_text(&self, agent: &Agent, instruction: &str) -> wa_agent::Result<String> {
        let request = ChatRequest {
            model: agent.llm_model.clone(),
            system_blocks: vec![SystemBlock::uncached(agent.system_prompt.clone())],
            messages: vec![Message { role: Role::User, blocks: vec![Block::text(instruction)] }],
            tools: Vec::new(),
            max_tokens: 512,
        };
        let outcome = self.runtime.run_turn(agent, request, &[]).await?;
        Ok(outcome.response.text())
    }

    /// Resolve what a reminder should actually say, respecting the
    /// Meta-provider free-text restriction: Meta agents can only send
    /// approved templates, never an AI-generated free-text reminder.
    async fn plan_reminder(&self, agent: &Agent, user: &User, reminder: &ScheduledReminder) -> Result<ReminderPlan, String> {
        let appointment =
            self.scheduler_store.get_appointment(reminder.appointment_id).map_err(|e| e.to_string())?;
        let variables = reminder_variables(&appointment, agent, user);

        match reminder.content_type {
            ReminderContentType::Template => {
                let name = reminder
                    .template
                    .clone()
                    .ok_or_else(|| "reminder has no template configured".to_string())?;
                match agent.provider {
                    WhatsAppProvider::Meta => Ok(ReminderPlan::Template { name, language: "en_US".to_string() }),
                    WhatsAppProvider::Wasender => {
                        let template = self
                            .scheduler_store
                            .find_template(agent.id, &name, "en_US")
                            .map_err(|e| e.to_string())?;
                        let body = template.map(|t| t.body).unwrap_or(name);
                        Ok(ReminderPlan::Text(substitute_variables(&body, &variables)))
                    }
                }
            }
            ReminderContentType::Ai => {
                if agent.provider == WhatsAppProvider::Meta {
                    return Err("meta provider requires templates (not implemented)".to_string());
                }
                let prompt = reminder.ai_prompt.as_deref().unwrap_or(DEFAULT_REMINDER_PROMPT);
                let history = self.recent_history_text(agent.id, user.id);
                let instruction = if history.is_empty() {
                    prompt.to_string()
                } else {
                    format!("{prompt}\n\nRecent conversation with this customer:\n{history}")
                };
                let text = self.generate_ai_text(agent, &instruction).await.map_err(|e| e.to_string())?;
                Ok(ReminderPlan::Text(text))
            }
        }
    }

    /// Up to the last 10 messages with this customer, oldest first, for
    /// conditioning AI-generated reminder/follow-up content.
    fn recent_history_text(&self, agent_id: i64, user_id: i64) -> String {
        let Ok(Some(conversation)) = self.store.find_conversation(agent_id, user_id) else {
            return String::new();
        };
        let Ok(messages) = self.store.recent_messages(conversation.id, 10) else {
            return String::new();
        };
        messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Builds the `{variable}` substitution set for reminder templates and AI
/// context: customer identity, appointment details in the agent's
/// timezone, and the agent's own name.
fn reminder_variables(appointment: &Appointment, agent: &Agent, user: &User) -> Vec<(&'static str, String)> {
    let local_start = to_local(appointment.start, &agent.timezone);
    let duration_minutes = (appointment.end - appointment.start).num_minutes();
    vec![
        ("customer_name", user.display_name.clone().unwrap_or_default()),
        ("customer_phone", user.phone.clone()),
        ("title", appointment.title.clone()),
        ("description", appointment.description.clone().unwrap_or_default()),
        ("date", format_date_local(appointment.start, &agent.timezone)),
        ("time", format_time_local(appointment.start, &agent.timezone)),
        ("day", hebrew_weekday(local_start).to_string()),
        ("duration", duration_minutes.to_string()),
        ("agent_name", agent.name.clone()),
    ]
}

fn substitute_variables(template: &str, variables: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

enum ReminderPlan {
    Template { name: String, language: String },
    Text(String),
}

/// Strips a ```-fenced code block, if present, then slices from the first
/// `{` to the last `}`: models routinely wrap their JSON decision in prose
/// or a fenced block even when told "strict JSON only".
fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```")
        .map(|rest| rest.trim_start_matches("json").trim_start_matches("JSON"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .map(str::trim)
        .unwrap_or(trimmed);

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&unfenced[start..=end])
}

#[async_trait::async_trait]
impl SchedulerSink for AppState {
    async fn send_reminder(&self, reminder: &ScheduledReminder) -> Result<(), String> {
        let agent = self.store.get_agent(reminder.agent_id).map_err(|e| e.to_string())?;
        let user = self.store.get_user(reminder.user_id).map_err(|e| e.to_string())?;
        let plan = self.plan_reminder(&agent, &user, reminder).await?;
        let sender = self.senders.sender_for(&agent).map_err(|e| e.to_string())?;

        let result = match &plan {
            ReminderPlan::Template { name, language } => {
                sender.send(&user.phone, OutboundContent::Template { name, language, body_params: &[] }).await
            }
            ReminderPlan::Text(text) => sender.send(&user.phone, OutboundContent::Text(text)).await,
        };
        result.map_err(|e| e.to_string())
    }

    async fn deliver_summary_webhook(
        &self,
        webhook_url: &str,
        conversation_id: i64,
        summary_text: &str,
    ) -> Result<(), String> {
        let conversation = self.store.get_conversation(conversation_id).map_err(|e| e.to_string())?;
        let agent = self.store.get_agent(conversation.agent_id).map_err(|e| e.to_string())?;
        let user = self.store.get_user(conversation.user_id).map_err(|e| e.to_string())?;
        let message_count = self.store.count_messages(conversation_id).map_err(|e| e.to_string())?;

        let client = reqwest::Client::new();
        let resp = client
            .post(webhook_url)
            .json(&serde_json::json!({
                "event": "conversation_summary",
                "timestamp": Utc::now().to_rfc3339(),
                "agent_id": agent.id,
                "agent_name": agent.name,
                "conversation_id": conversation_id,
                "customer_name": user.display_name.unwrap_or_default(),
                "customer_phone": user.phone,
                "message_count": message_count,
                "summary": summary_text,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook responded with {}", resp.status()))
        }
    }

    /// Unlike the reminder/summary sinks, this one also performs the send:
    /// the scheduler only wants to know what happened so it can persist
    /// `scheduled_followups` accordingly, never to perform a second round
    /// trip itself.
    async fn decide_followup(&self, followup: &ScheduledFollowup) -> FollowupOutcome {
        let agent = match self.store.get_agent(followup.agent_id) {
            Ok(a) => a,
            Err(e) => return FollowupOutcome::Skip { reason: format!("agent lookup failed: {e}") },
        };
        let conversation = match self.store.get_conversation(followup.conversation_id) {
            Ok(c) => c,
            Err(e) => return FollowupOutcome::Skip { reason: format!("conversation lookup failed: {e}") },
        };
        if conversation.blocks_outbound() {
            return FollowupOutcome::Skip { reason: "conversation paused or opted out".into() };
        }

        let hours = ActiveHours::new(
            agent.followups.active_hours.start_hour,
            agent.followups.active_hours.start_minute,
            agent.followups.active_hours.end_hour,
            agent.followups.active_hours.end_minute,
        );
        let now = Utc::now();
        if hours.clamp(now, &agent.timezone) != now {
            return FollowupOutcome::Skip { reason: "outside configured active hours".into() };
        }

        let prompt = format!("{}{FOLLOWUP_DECISION_SUFFIX}", followup.step_instruction);
        let raw = match self.generate_ai_text(&agent, &prompt).await {
            Ok(t) => t,
            Err(e) => return FollowupOutcome::Skip { reason: format!("generation failed: {e}") },
        };
        let Some(object) = extract_json_object(&raw) else {
            return FollowupOutcome::Skip { reason: "model response was not valid JSON".into() };
        };
        let decision: serde_json::Value = match serde_json::from_str(object) {
            Ok(v) => v,
            Err(_) => return FollowupOutcome::Skip { reason: "model response was not valid JSON".into() },
        };

        if decision.get("action").and_then(|v| v.as_str()) != Some("send") {
            let reason =
                decision.get("reason").and_then(|v| v.as_str()).unwrap_or("model decided to skip").to_string();
            return FollowupOutcome::Skip { reason };
        }
        let Some(content) = decision.get("content").and_then(|v| v.as_str()).map(str::to_string) else {
            return FollowupOutcome::Skip { reason: "model said send but gave no content".into() };
        };

        let meta_window_open = conversation
            .last_customer_message_at
            .map(|t| Utc::now() - t < Duration::hours(24))
            .unwrap_or(false);

        let (sent_via, template_name) = if agent.provider == WhatsAppProvider::Meta && !meta_window_open {
            match agent.followups.meta_templates.first() {
                Some(t) => (SentVia::MetaTemplate, Some(t.name.clone())),
                None => {
                    return FollowupOutcome::Skip {
                        reason: "24h customer-service window closed, no meta template configured".into(),
                    }
                }
            }
        } else {
            (SentVia::FreeText, None)
        };

        let user = match self.store.get_user(followup.user_id) {
            Ok(u) => u,
            Err(e) => return FollowupOutcome::Skip { reason: format!("user lookup failed: {e}") },
        };
        let sender = match self.senders.sender_for(&agent) {
            Ok(s) => s,
            Err(e) => return FollowupOutcome::Skip { reason: format!("sender unavailable: {e}") },
        };
        let outbound = match (&sent_via, &template_name) {
            (SentVia::MetaTemplate, Some(name)) => {
                OutboundContent::Template { name, language: "en_US", body_params: &[] }
            }
            _ => OutboundContent::Text(&content),
        };

        match sender.send(&user.phone, outbound).await {
            Ok(()) => FollowupOutcome::Send { content, sent_via, template_name },
            Err(e) => {
                warn!(conversation_id = followup.conversation_id, error = %e, "follow-up send failed");
                FollowupOutcome::Skip { reason: format!("send failed: {e}") }
            }
        }
    }
}

/// Assemble the full Axum router: health check plus Meta/WaSender webhook
/// ingress. No WS/chat/terminal surface — this deployment has exactly one
/// external interface, inbound WhatsApp webhooks.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/webhook",
            get(crate::http::webhooks::meta_verify_handler).post(crate::http::webhooks::meta_webhook_handler),
        )
        .route("/webhook/wasender/{agent_id}", axum::routing::post(crate::http::webhooks::wasender_webhook_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
