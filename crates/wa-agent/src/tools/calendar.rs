//! Calendar tools (§4.5): availability, booking, listing, cancellation, and
//! rescheduling. Booking and rescheduling re-materialize reminders from the
//! agent's configured rules; external calendar sync is out of scope (no
//! Google Calendar client exists anywhere in this codebase to ground one
//! on — see DESIGN.md).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use wa_core::model::{Agent, AppointmentStatus, ReminderContentType};
use wa_scheduler::reminders::NewReminder;
use wa_scheduler::{SchedulerError, SchedulerStore};

use super::{Tool, ToolResult};

const MIN_DURATION_MINUTES: i64 = 5;
const MAX_DURATION_MINUTES: i64 = 480;

fn parse_future_datetime(raw: &str) -> Result<DateTime<Utc>, String> {
    let parsed: DateTime<Utc> = raw
        .parse()
        .map_err(|_| "invalid datetime, expected RFC3339".to_string())?;
    if parsed <= Utc::now() {
        return Err("requested time must be in the future".to_string());
    }
    Ok(parsed)
}

fn validate_duration(minutes: i64) -> Result<(), String> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&minutes) {
        return Err(format!(
            "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes"
        ));
    }
    Ok(())
}

/// Materializes every configured reminder rule with `minutes_before > 0` for
/// a freshly booked or rescheduled appointment, skipping rules whose fire
/// time has already passed.
fn materialize_reminders_for(
    scheduler_store: &SchedulerStore,
    agent: &Agent,
    appointment_id: i64,
    user_id: i64,
    start: DateTime<Utc>,
) {
    for (index, rule) in agent.reminders.rules.iter().enumerate() {
        if rule.minutes_before <= 0 {
            continue;
        }
        let scheduled_for = start - Duration::minutes(rule.minutes_before);
        if scheduled_for <= Utc::now() {
            continue;
        }
        let _ = scheduler_store.materialize_reminder(NewReminder {
            appointment_id,
            agent_id: agent.id,
            user_id,
            scheduled_for,
            content_type: rule.content_type,
            template: rule.template.as_deref(),
            ai_prompt: rule.ai_prompt.as_deref(),
            rule_index: index as i64,
        });
    }
}

pub struct CheckAvailabilityTool {
    scheduler_store: Arc<SchedulerStore>,
    agent_id: i64,
}

impl CheckAvailabilityTool {
    pub fn new(scheduler_store: Arc<SchedulerStore>, agent_id: i64) -> Self {
        Self { scheduler_store, agent_id }
    }
}

#[async_trait]
impl Tool for CheckAvailabilityTool {
    fn name(&self) -> &str {
        "check_availability"
    }

    fn description(&self) -> &str {
        "Check whether a given time slot is free before offering it to the customer."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "start": {"type": "string", "description": "RFC3339 start time."},
                "duration_minutes": {"type": "integer", "description": "Length of the slot in minutes (5-480)."}
            },
            "required": ["start", "duration_minutes"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let start_raw = match input.get("start").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolResult::error("missing required parameter: start"),
        };
        let duration = input.get("duration_minutes").and_then(|v| v.as_i64()).unwrap_or(0);
        let start = match parse_future_datetime(start_raw) {
            Ok(d) => d,
            Err(e) => return ToolResult::error(e),
        };
        if let Err(e) = validate_duration(duration) {
            return ToolResult::error(e);
        }
        let end = start + Duration::minutes(duration);
        match self.scheduler_store.conflicting_appointments(self.agent_id, start, end, None) {
            Ok(conflicts) if conflicts.is_empty() => ToolResult::success("That slot is available."),
            Ok(_) => ToolResult::success("That slot is already booked. Please suggest a different time."),
            Err(e) => ToolResult::error(format!("check_availability failed: {e}")),
        }
    }
}

pub struct BookAppointmentTool {
    scheduler_store: Arc<SchedulerStore>,
    agent: Arc<Agent>,
    user_id: i64,
}

impl BookAppointmentTool {
    pub fn new(scheduler_store: Arc<SchedulerStore>, agent: Arc<Agent>, user_id: i64) -> Self {
        Self { scheduler_store, agent, user_id }
    }
}

#[async_trait]
impl Tool for BookAppointmentTool {
    fn name(&self) -> &str {
        "book_appointment"
    }

    fn description(&self) -> &str {
        "Book an appointment for the current customer. Always call check_availability first."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "start": {"type": "string", "description": "RFC3339 start time."},
                "duration_minutes": {"type": "integer"},
                "title": {"type": "string"},
                "description": {"type": "string"}
            },
            "required": ["start", "duration_minutes", "title"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let start_raw = match input.get("start").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolResult::error("missing required parameter: start"),
        };
        let duration = input.get("duration_minutes").and_then(|v| v.as_i64()).unwrap_or(0);
        let title = match input.get("title").and_then(|v| v.as_str()) {
            Some(t) if !t.trim().is_empty() => t,
            _ => return ToolResult::error("missing required parameter: title"),
        };
        let description = input.get("description").and_then(|v| v.as_str());

        let start = match parse_future_datetime(start_raw) {
            Ok(d) => d,
            Err(e) => return ToolResult::error(e),
        };
        if let Err(e) = validate_duration(duration) {
            return ToolResult::error(e);
        }
        let end = start + Duration::minutes(duration);

        match self.scheduler_store.book_appointment(
            self.agent.id,
            self.user_id,
            start,
            end,
            title,
            description,
            None,
        ) {
            Ok(appointment) => {
                materialize_reminders_for(
                    &self.scheduler_store,
                    &self.agent,
                    appointment.id,
                    self.user_id,
                    start,
                );
                ToolResult::success(format!(
                    "Appointment booked: {} at {}.",
                    appointment.title,
                    appointment.start.to_rfc3339()
                ))
            }
            Err(SchedulerError::AppointmentConflict { .. }) => {
                ToolResult::error("המועד הזה כבר תפוס, אפשר להציע זמן אחר.")
            }
            Err(e) => ToolResult::error(format!("book_appointment failed: {e}")),
        }
    }
}

pub struct GetMyAppointmentsTool {
    scheduler_store: Arc<SchedulerStore>,
    agent_id: i64,
    user_id: i64,
}

impl GetMyAppointmentsTool {
    pub fn new(scheduler_store: Arc<SchedulerStore>, agent_id: i64, user_id: i64) -> Self {
        Self { scheduler_store, agent_id, user_id }
    }
}

#[async_trait]
impl Tool for GetMyAppointmentsTool {
    fn name(&self) -> &str {
        "get_my_appointments"
    }

    fn description(&self) -> &str {
        "List the current customer's upcoming scheduled appointments."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match self.scheduler_store.user_upcoming_appointments(self.agent_id, self.user_id) {
            Ok(appointments) if appointments.is_empty() => {
                ToolResult::success("No upcoming appointments.")
            }
            Ok(appointments) => {
                let mut out = String::new();
                for a in &appointments {
                    out.push_str(&format!("#{} {} at {}\n", a.id, a.title, a.start.to_rfc3339()));
                }
                ToolResult::success(out.trim_end().to_string())
            }
            Err(e) => ToolResult::error(format!("get_my_appointments failed: {e}")),
        }
    }
}

pub struct CancelAppointmentTool {
    scheduler_store: Arc<SchedulerStore>,
    user_id: i64,
}

impl CancelAppointmentTool {
    pub fn new(scheduler_store: Arc<SchedulerStore>, user_id: i64) -> Self {
        Self { scheduler_store, user_id }
    }
}

#[async_trait]
impl Tool for CancelAppointmentTool {
    fn name(&self) -> &str {
        "cancel_appointment"
    }

    fn description(&self) -> &str {
        "Cancel one of the current customer's appointments by id."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"appointment_id": {"type": "integer"}},
            "required": ["appointment_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let appointment_id = match input.get("appointment_id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => return ToolResult::error("missing required parameter: appointment_id"),
        };
        let appointment = match self.scheduler_store.get_appointment(appointment_id) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("cancel_appointment failed: {e}")),
        };
        if appointment.user_id != self.user_id {
            return ToolResult::error("that appointment does not belong to this customer");
        }
        if let Err(e) = self
            .scheduler_store
            .set_appointment_status(appointment_id, AppointmentStatus::Cancelled)
        {
            return ToolResult::error(format!("cancel_appointment failed: {e}"));
        }
        let _ = self.scheduler_store.cancel_reminders_for_appointment(appointment_id);
        ToolResult::success("Appointment cancelled.")
    }
}

pub struct RescheduleAppointmentTool {
    scheduler_store: Arc<SchedulerStore>,
    agent: Arc<Agent>,
    user_id: i64,
}

impl RescheduleAppointmentTool {
    pub fn new(scheduler_store: Arc<SchedulerStore>, agent: Arc<Agent>, user_id: i64) -> Self {
        Self { scheduler_store, agent, user_id }
    }
}

#[async_trait]
impl Tool for RescheduleAppointmentTool {
    fn name(&self) -> &str {
        "reschedule_appointment"
    }

    fn description(&self) -> &str {
        "Move one of the current customer's appointments to a new time."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "appointment_id": {"type": "integer"},
                "new_start": {"type": "string", "description": "RFC3339 new start time."},
                "duration_minutes": {"type": "integer"}
            },
            "required": ["appointment_id", "new_start", "duration_minutes"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let appointment_id = match input.get("appointment_id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => return ToolResult::error("missing required parameter: appointment_id"),
        };
        let new_start_raw = match input.get("new_start").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolResult::error("missing required parameter: new_start"),
        };
        let duration = input.get("duration_minutes").and_then(|v| v.as_i64()).unwrap_or(0);

        let existing = match self.scheduler_store.get_appointment(appointment_id) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("reschedule_appointment failed: {e}")),
        };
        if existing.user_id != self.user_id {
            return ToolResult::error("that appointment does not belong to this customer");
        }

        let new_start = match parse_future_datetime(new_start_raw) {
            Ok(d) => d,
            Err(e) => return ToolResult::error(e),
        };
        if let Err(e) = validate_duration(duration) {
            return ToolResult::error(e);
        }
        let new_end = new_start + Duration::minutes(duration);

        match self.scheduler_store.reschedule_appointment(appointment_id, new_start, new_end) {
            Ok(appointment) => {
                let _ = self.scheduler_store.cancel_reminders_for_appointment(appointment_id);
                materialize_reminders_for(
                    &self.scheduler_store,
                    &self.agent,
                    appointment.id,
                    self.user_id,
                    new_start,
                );
                ToolResult::success(format!(
                    "Appointment rescheduled to {}.",
                    appointment.start.to_rfc3339()
                ))
            }
            Err(SchedulerError::AppointmentConflict { .. }) => {
                ToolResult::error("המועד הזה כבר תפוס, אפשר להציע זמן אחר.")
            }
            Err(e) => ToolResult::error(format!("reschedule_appointment failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;
    use wa_store::Store;

    fn sample_agent(id: i64) -> Agent {
        Agent {
            id,
            name: "Bot".into(),
            active: true,
            provider: WhatsAppProvider::Meta,
            credentials: Default::default(),
            llm_model: "claude-3-5-sonnet".into(),
            custom_api_keys: Default::default(),
            system_prompt: String::new(),
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

    fn seed_user(store: &Store) -> i64 {
        store.find_or_create_user_by_phone("+972500000030").unwrap().id
    }

    #[tokio::test]
    async fn booking_a_conflicting_slot_returns_hebrew_message() {
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let store = Store::open_in_memory().unwrap();
        let user_id = seed_user(&store);
        let agent = Arc::new(sample_agent(1));
        let start = (Utc::now() + Duration::hours(2)).to_rfc3339();

        let book = BookAppointmentTool::new(Arc::clone(&scheduler_store), Arc::clone(&agent), user_id);
        let first = book
            .execute(serde_json::json!({"start": start, "duration_minutes": 30, "title": "Checkup"}))
            .await;
        assert!(!first.is_error);

        let second = book
            .execute(serde_json::json!({"start": start, "duration_minutes": 30, "title": "Other"}))
            .await;
        assert!(second.is_error);
        assert!(second.content.contains("תפוס"));
    }

    #[tokio::test]
    async fn rejects_invalid_duration() {
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let store = Store::open_in_memory().unwrap();
        let user_id = seed_user(&store);
        let agent = Arc::new(sample_agent(1));
        let start = (Utc::now() + Duration::hours(2)).to_rfc3339();

        let book = BookAppointmentTool::new(scheduler_store, agent, user_id);
        let result = book
            .execute(serde_json::json!({"start": start, "duration_minutes": 1000, "title": "Checkup"}))
            .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn cancel_rejects_appointment_not_owned_by_caller() {
        let scheduler_store = Arc::new(SchedulerStore::open_in_memory().unwrap());
        let start = Utc::now() + Duration::hours(2);
        let appt = scheduler_store
            .book_appointment(1, 999, start, start + Duration::minutes(30), "Checkup", None, None)
            .unwrap();

        let cancel = CancelAppointmentTool::new(scheduler_store, 1);
        let result = cancel.execute(serde_json::json!({"appointment_id": appt.id})).await;
        assert!(result.is_error);
    }
}
