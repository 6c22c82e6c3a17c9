use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use wa_core::model::{ReminderContentType, ReminderStatus, ScheduledReminder};

use crate::error::Result;
use crate::store::SchedulerStore;

fn status_to_str(s: ReminderStatus) -> &'static str {
    match s {
        ReminderStatus::Pending => "pending",
        ReminderStatus::Processing => "processing",
        ReminderStatus::Sent => "sent",
        ReminderStatus::Failed => "failed",
        ReminderStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> ReminderStatus {
    match s {
        "processing" => ReminderStatus::Processing,
        "sent" => ReminderStatus::Sent,
        "failed" => ReminderStatus::Failed,
        "cancelled" => ReminderStatus::Cancelled,
        _ => ReminderStatus::Pending,
    }
}

fn content_type_to_str(t: ReminderContentType) -> &'static str {
    match t {
        ReminderContentType::Template => "template",
        ReminderContentType::Ai => "ai",
    }
}

fn content_type_from_str(s: &str) -> ReminderContentType {
    match s {
        "ai" => ReminderContentType::Ai,
        _ => ReminderContentType::Template,
    }
}

fn row_to_reminder(row: &Row) -> rusqlite::Result<ScheduledReminder> {
    let scheduled_for: String = row.get("scheduled_for")?;
    let created_at: String = row.get("created_at")?;
    let sent_at: Option<String> = row.get("sent_at")?;
    let status: String = row.get("status")?;
    let content_type: String = row.get("content_type")?;
    Ok(ScheduledReminder {
        id: row.get("id")?,
        appointment_id: row.get("appointment_id")?,
        agent_id: row.get("agent_id")?,
        user_id: row.get("user_id")?,
        scheduled_for: scheduled_for.parse().unwrap_or_else(|_| Utc::now()),
        status: status_from_str(&status),
        content_type: content_type_from_str(&content_type),
        template: row.get("template")?,
        ai_prompt: row.get("ai_prompt")?,
        rule_index: row.get("rule_index")?,
        sent_at: sent_at.map(|s| s.parse().unwrap_or_else(|_| Utc::now())),
        error_message: row.get("error_message")?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

pub struct NewReminder<'a> {
    pub appointment_id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub content_type: ReminderContentType,
    pub template: Option<&'a str>,
    pub ai_prompt: Option<&'a str>,
    pub rule_index: i64,
}

impl SchedulerStore {
    /// (I4) `UNIQUE(appointment_id, rule_index)` makes re-materialization
    /// idempotent: a reschedule can safely delete-then-recreate without
    /// risking a duplicate `sent` reminder for the same rule.
    pub fn materialize_reminder(&self, reminder: NewReminder<'_>) -> Result<ScheduledReminder> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO scheduled_reminders
                (appointment_id, agent_id, user_id, scheduled_for, status,
                 content_type, template, ai_prompt, rule_index, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(appointment_id, rule_index) DO UPDATE SET
                scheduled_for = excluded.scheduled_for,
                status = 'pending',
                content_type = excluded.content_type,
                template = excluded.template,
                ai_prompt = excluded.ai_prompt,
                sent_at = NULL,
                error_message = NULL",
            params![
                reminder.appointment_id,
                reminder.agent_id,
                reminder.user_id,
                reminder.scheduled_for.to_rfc3339(),
                content_type_to_str(reminder.content_type),
                reminder.template,
                reminder.ai_prompt,
                reminder.rule_index,
                now,
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM scheduled_reminders WHERE appointment_id = ?1 AND rule_index = ?2",
            params![reminder.appointment_id, reminder.rule_index],
            |r| r.get(0),
        )?;
        drop(conn);
        self.get_reminder(id)
    }

    pub fn cancel_reminders_for_appointment(&self, appointment_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_reminders SET status = 'cancelled'
             WHERE appointment_id = ?1 AND status = 'pending'",
            params![appointment_id],
        )?;
        Ok(())
    }

    pub fn get_reminder(&self, id: i64) -> Result<ScheduledReminder> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM scheduled_reminders WHERE id = ?1",
            params![id],
            row_to_reminder,
        )?)
    }

    /// Claims up to `limit` due reminders by flipping them straight to
    /// `processing` in the same statement that selects them — the guard
    /// against a second scheduler instance claiming the same row (the
    /// resolved "add a Processing state" open question).
    pub fn claim_due_reminders(&self, limit: i64) -> Result<Vec<ScheduledReminder>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM scheduled_reminders
                 WHERE status = 'pending' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        };
        for id in &ids {
            conn.execute(
                "UPDATE scheduled_reminders SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
        }
        drop(conn);
        let mut out = Vec::new();
        for id in ids {
            out.push(self.get_reminder(id)?);
        }
        Ok(out)
    }

    pub fn mark_reminder_sent(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_reminders SET status = 'sent', sent_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_reminder_failed(&self, id: i64, error_message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_reminders SET status = 'failed', error_message = ?2 WHERE id = ?1",
            params![id, error_message],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(agent_id: i64, appointment_id: i64, rule_index: i64, when: DateTime<Utc>) -> NewReminder<'static> {
        NewReminder {
            appointment_id,
            agent_id,
            user_id: 1,
            scheduled_for: when,
            content_type: ReminderContentType::Template,
            template: Some("Reminder: your appointment is soon"),
            ai_prompt: None,
            rule_index,
        }
    }

    #[test]
    fn claim_due_reminders_flips_to_processing_and_is_exclusive() {
        let store = SchedulerStore::open_in_memory().unwrap();
        store
            .materialize_reminder(sample(1, 1, 0, Utc::now() - Duration::minutes(1)))
            .unwrap();

        let first_claim = store.claim_due_reminders(10).unwrap();
        assert_eq!(first_claim.len(), 1);
        assert_eq!(first_claim[0].status, ReminderStatus::Processing);

        let second_claim = store.claim_due_reminders(10).unwrap();
        assert!(second_claim.is_empty());
    }

    #[test]
    fn future_reminders_are_not_claimed() {
        let store = SchedulerStore::open_in_memory().unwrap();
        store
            .materialize_reminder(sample(1, 1, 0, Utc::now() + Duration::hours(1)))
            .unwrap();
        assert!(store.claim_due_reminders(10).unwrap().is_empty());
    }

    #[test]
    fn re_materializing_same_rule_resets_instead_of_duplicating() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let first = store
            .materialize_reminder(sample(1, 1, 0, Utc::now() + Duration::hours(1)))
            .unwrap();
        let second = store
            .materialize_reminder(sample(1, 1, 0, Utc::now() + Duration::hours(2)))
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn cancelling_appointment_reminders_skips_already_sent() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let reminder = store
            .materialize_reminder(sample(1, 1, 0, Utc::now() - Duration::minutes(1)))
            .unwrap();
        store.claim_due_reminders(10).unwrap();
        store.mark_reminder_sent(reminder.id).unwrap();

        store.cancel_reminders_for_appointment(1).unwrap();
        let fetched = store.get_reminder(reminder.id).unwrap();
        assert_eq!(fetched.status, ReminderStatus::Sent);
    }
}
