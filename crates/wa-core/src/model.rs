//! Relational domain model shared by every crate that reads or writes the
//! conversational store (§3 of the spec). All config blobs are immutable
//! value types, deserialized whole from their JSON column and persisted
//! whole on update — there is no "dirty flag" to forget to set, which is the
//! redesign point called out for the original ORM-backed implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhatsAppProvider {
    Meta,
    Wasender,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaCredentials {
    pub phone_number_id: String,
    pub access_token: String,
    pub verify_token: String,
    #[serde(default)]
    pub waba_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WasenderCredentials {
    pub api_key: String,
    pub session: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub meta: Option<MetaCredentials>,
    #[serde(default)]
    pub wasender: Option<WasenderCredentials>,
}

/// Reminder rule: "send a reminder `minutes_before` the appointment starts".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderRule {
    pub minutes_before: i64,
    #[serde(default)]
    pub content_type: ReminderContentType,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub ai_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemindersConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ReminderRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummariesConfig {
    #[serde(default)]
    pub enabled: bool,
    pub delay_minutes: i64,
    pub min_messages: i64,
    pub max_messages: i64,
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_retry_count")]
    pub webhook_retry_count: i64,
    #[serde(default = "default_webhook_retry_delay_secs")]
    pub webhook_retry_delay_secs: i64,
}

fn default_webhook_retry_count() -> i64 {
    3
}
fn default_webhook_retry_delay_secs() -> i64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupStep {
    pub delay_hours: f64,
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaTemplateRef {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHoursConfig {
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
}

impl Default for ActiveHoursConfig {
    fn default() -> Self {
        Self {
            start_hour: 9,
            start_minute: 0,
            end_hour: 21,
            end_minute: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowupsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub min_messages: i64,
    #[serde(default)]
    pub active_hours: ActiveHoursConfig,
    #[serde(default)]
    pub sequence: Vec<FollowupStep>,
    #[serde(default)]
    pub meta_templates: Vec<MetaTemplateRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_media_max_per_message")]
    pub max_per_message: usize,
}

fn default_media_max_per_message() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_message_threshold")]
    pub message_threshold: i64,
    #[serde(default = "default_messages_after_summary")]
    pub messages_after_summary: i64,
    #[serde(default = "default_full_summary_every")]
    pub full_summary_every: i64,
}

impl Default for ContextSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            message_threshold: default_message_threshold(),
            messages_after_summary: default_messages_after_summary(),
            full_summary_every: default_full_summary_every(),
        }
    }
}

fn default_message_threshold() -> i64 {
    30
}
fn default_messages_after_summary() -> i64 {
    10
}
fn default_full_summary_every() -> i64 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch_messages: usize,
}

fn default_debounce_seconds() -> u64 {
    3
}
fn default_max_batch() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GoogleTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub appointment_instruction: Option<String>,
    #[serde(default)]
    pub google_tokens: Option<GoogleTokens>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub provider: WhatsAppProvider,
    pub credentials: ProviderCredentials,
    pub llm_model: String,
    pub custom_api_keys: std::collections::HashMap<String, String>,
    pub system_prompt: String,
    pub timezone: String,
    pub batching: BatchingConfig,
    pub calendar: CalendarConfig,
    pub reminders: RemindersConfig,
    pub summaries: SummariesConfig,
    pub followups: FollowupsConfig,
    pub media: MediaConfig,
    pub context_summary: ContextSummaryConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn timezone_or_default(&self) -> &str {
        if self.timezone.is_empty() {
            crate::time::DEFAULT_TZ
        } else {
            &self.timezone
        }
    }
}

// ---------------------------------------------------------------------------
// User / Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub phone: String,
    pub display_name: Option<String>,
    pub gender: Gender,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub paused: bool,
    pub opted_out: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_customer_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// (I5) `paused` or `opted_out` conversations never trigger outbound
    /// LLM replies or follow-ups, though inbound messages are still stored.
    pub fn blocks_outbound(&self) -> bool {
        self.paused || self.opted_out
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContentType {
    Text,
    Voice,
    Image,
    Media,
    Reminder,
    Followup,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content_type: MessageContentType,
    pub content: String,
    pub media_id: Option<String>,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Appointment / Reminder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Appointment {
    pub id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub status: AppointmentStatus,
    pub external_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `pending -> processing -> (sent | failed)`; `pending -> cancelled` on
/// appointment changes. `processing` is the intermediate state added per
/// the spec's resolved open question — it guards the pickup/send window so
/// a second scheduler instance cannot double-claim the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReminderContentType {
    #[default]
    Template,
    Ai,
}

#[derive(Debug, Clone)]
pub struct ScheduledReminder {
    pub id: i64,
    pub appointment_id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub status: ReminderStatus,
    pub content_type: ReminderContentType,
    pub template: Option<String>,
    pub ai_prompt: Option<String>,
    pub rule_index: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryWebhookStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub id: i64,
    pub conversation_id: i64,
    pub last_message_at: DateTime<Utc>,
    pub summary: String,
    pub status: SummaryWebhookStatus,
    pub webhook_attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub webhook_sent_at: Option<DateTime<Utc>>,
    pub webhook_last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationContextSummary {
    pub conversation_id: i64,
    pub summary: String,
    pub last_message_id_covered: i64,
    pub incremental_count: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Follow-ups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupStatus {
    Pending,
    Evaluating,
    Sent,
    Skipped,
    Cancelled,
}

impl FollowupStatus {
    /// P3: a follow-up row never transitions out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FollowupStatus::Sent | FollowupStatus::Skipped | FollowupStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentVia {
    FreeText,
    MetaTemplate,
}

#[derive(Debug, Clone)]
pub struct ScheduledFollowup {
    pub id: i64,
    pub conversation_id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub followup_number: i64,
    pub step_instruction: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: FollowupStatus,
    pub content: Option<String>,
    pub ai_reason: Option<String>,
    pub sent_via: Option<SentVia>,
    pub template_name: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Templates / media
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WhatsAppTemplate {
    pub id: i64,
    pub agent_id: i64,
    pub name: String,
    pub language: String,
    pub body: String,
    pub param_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentMedia {
    pub id: i64,
    pub agent_id: i64,
    pub media_id: String,
    pub url: String,
    pub mime_type: String,
    pub display_name: String,
    pub default_caption: Option<String>,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Knowledge / products — `search_knowledge` and `query_products` tool backing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KnowledgeEntry {
    pub id: i64,
    pub agent_id: i64,
    pub topic: String,
    pub content: String,
    pub tags: String,
}

#[derive(Debug, Clone)]
pub struct Product {
    pub id: i64,
    pub agent_id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub sku: Option<String>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn followup_terminal_states() {
        assert!(FollowupStatus::Sent.is_terminal());
        assert!(FollowupStatus::Skipped.is_terminal());
        assert!(FollowupStatus::Cancelled.is_terminal());
        assert!(!FollowupStatus::Pending.is_terminal());
        assert!(!FollowupStatus::Evaluating.is_terminal());
    }

    #[test]
    fn conversation_blocks_outbound_on_either_flag() {
        let base = Conversation {
            id: 1,
            agent_id: 1,
            user_id: 1,
            paused: false,
            opted_out: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_customer_message_at: None,
        };
        assert!(!base.blocks_outbound());
        assert!(Conversation { paused: true, ..base.clone() }.blocks_outbound());
        assert!(Conversation { opted_out: true, ..base }.blocks_outbound());
    }
}
