use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use wa_core::model::{FollowupStatus, ScheduledFollowup, SentVia};

use crate::error::Result;
use crate::store::SchedulerStore;

fn status_to_str(s: FollowupStatus) -> &'static str {
    match s {
        FollowupStatus::Pending => "pending",
        FollowupStatus::Evaluating => "evaluating",
        FollowupStatus::Sent => "sent",
        FollowupStatus::Skipped => "skipped",
        FollowupStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> FollowupStatus {
    match s {
        "evaluating" => FollowupStatus::Evaluating,
        "sent" => FollowupStatus::Sent,
        "skipped" => FollowupStatus::Skipped,
        "cancelled" => FollowupStatus::Cancelled,
        _ => FollowupStatus::Pending,
    }
}

fn sent_via_to_str(s: SentVia) -> &'static str {
    match s {
        SentVia::FreeText => "free_text",
        SentVia::MetaTemplate => "meta_template",
    }
}

fn sent_via_from_str(s: &str) -> SentVia {
    match s {
        "meta_template" => SentVia::MetaTemplate,
        _ => SentVia::FreeText,
    }
}

fn row_to_followup(row: &Row) -> rusqlite::Result<ScheduledFollowup> {
    let scheduled_for: String = row.get("scheduled_for")?;
    let created_at: String = row.get("created_at")?;
    let sent_at: Option<String> = row.get("sent_at")?;
    let status: String = row.get("status")?;
    let sent_via: Option<String> = row.get("sent_via")?;
    Ok(ScheduledFollowup {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        agent_id: row.get("agent_id")?,
        user_id: row.get("user_id")?,
        followup_number: row.get("followup_number")?,
        step_instruction: row.get("step_instruction")?,
        scheduled_for: scheduled_for.parse().unwrap_or_else(|_| Utc::now()),
        status: status_from_str(&status),
        content: row.get("content")?,
        ai_reason: row.get("ai_reason")?,
        sent_via: sent_via.map(|s| sent_via_from_str(&s)),
        template_name: row.get("template_name")?,
        sent_at: sent_at.map(|s| s.parse().unwrap_or_else(|_| Utc::now())),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl SchedulerStore {
    pub fn schedule_followup(
        &self,
        conversation_id: i64,
        agent_id: i64,
        user_id: i64,
        followup_number: i64,
        step_instruction: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduledFollowup> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO scheduled_followups
                (conversation_id, agent_id, user_id, followup_number, step_instruction,
                 scheduled_for, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                conversation_id,
                agent_id,
                user_id,
                followup_number,
                step_instruction,
                scheduled_for.to_rfc3339(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_followup(id)
    }

    pub fn get_followup(&self, id: i64) -> Result<ScheduledFollowup> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM scheduled_followups WHERE id = ?1",
            params![id],
            row_to_followup,
        )?)
    }

    /// (I3) Cancels every non-terminal follow-up for a conversation. Called
    /// whenever the customer speaks again, regardless of which step fired.
    pub fn cancel_pending_followups(&self, conversation_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE scheduled_followups SET status = 'cancelled'
             WHERE conversation_id = ?1 AND status IN ('pending', 'evaluating')",
            params![conversation_id],
        )?;
        Ok(n)
    }

    /// Moves due rows into `evaluating` atomically, mirroring the reminder
    /// claim pattern, so a second scheduler instance can't double-process.
    pub fn claim_due_followups(&self, limit: i64) -> Result<Vec<ScheduledFollowup>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM scheduled_followups
                 WHERE status = 'pending' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        };
        for id in &ids {
            conn.execute(
                "UPDATE scheduled_followups SET status = 'evaluating' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
        }
        drop(conn);
        let mut out = Vec::new();
        for id in ids {
            out.push(self.get_followup(id)?);
        }
        Ok(out)
    }

    pub fn mark_followup_sent(&self, id: i64, content: &str, sent_via: SentVia, template_name: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_followups
             SET status = 'sent', content = ?2, sent_via = ?3, template_name = ?4, sent_at = ?5
             WHERE id = ?1",
            params![
                id,
                content,
                sent_via_to_str(sent_via),
                template_name,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_followup_skipped(&self, id: i64, ai_reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_followups SET status = 'skipped', ai_reason = ?2 WHERE id = ?1",
            params![id, ai_reason],
        )?;
        Ok(())
    }

    /// `false` if the rule's trailing edge already fired for this
    /// conversation — guards against scheduling a step twice.
    pub fn has_pending_or_sent_followup(&self, conversation_id: i64, followup_number: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM scheduled_followups
             WHERE conversation_id = ?1 AND followup_number = ?2
               AND status NOT IN ('cancelled', 'skipped')",
            params![conversation_id, followup_number],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cancel_pending_clears_pending_and_evaluating_only() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let a = store
            .schedule_followup(1, 1, 1, 1, "nudge", Utc::now() + Duration::hours(1))
            .unwrap();
        let b = store
            .schedule_followup(1, 1, 1, 2, "nudge 2", Utc::now() - Duration::minutes(1))
            .unwrap();
        store.claim_due_followups(10).unwrap();
        store.mark_followup_sent(a.id, "hi again", SentVia::FreeText, None).unwrap();

        let cancelled = store.cancel_pending_followups(1).unwrap();
        assert_eq!(cancelled, 1);

        let sent_row = store.get_followup(a.id).unwrap();
        assert_eq!(sent_row.status, FollowupStatus::Sent);
        let evaluating_row = store.get_followup(b.id).unwrap();
        assert_eq!(evaluating_row.status, FollowupStatus::Cancelled);
    }

    #[test]
    fn sent_and_skipped_are_terminal_and_unaffected_by_cancel() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let followup = store
            .schedule_followup(1, 1, 1, 1, "nudge", Utc::now() - Duration::minutes(1))
            .unwrap();
        store.claim_due_followups(10).unwrap();
        store.mark_followup_skipped(followup.id, "customer seems busy").unwrap();
        store.cancel_pending_followups(1).unwrap();
        let fetched = store.get_followup(followup.id).unwrap();
        assert!(fetched.status.is_terminal());
        assert_eq!(fetched.status, FollowupStatus::Skipped);
    }

    #[test]
    fn has_pending_or_sent_detects_in_flight_step() {
        let store = SchedulerStore::open_in_memory().unwrap();
        assert!(!store.has_pending_or_sent_followup(1, 1).unwrap());
        store
            .schedule_followup(1, 1, 1, 1, "nudge", Utc::now() + Duration::hours(1))
            .unwrap();
        assert!(store.has_pending_or_sent_followup(1, 1).unwrap());
    }
}
