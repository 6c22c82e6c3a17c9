use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use wa_core::model::{ConversationContextSummary, ConversationSummary, SummaryWebhookStatus};

use crate::error::{is_unique_violation, Result};
use crate::store::SchedulerStore;

/// One row of `detect_eligible_conversations`'s result: a conversation that
/// just crossed its agent's quiescence/message-count thresholds.
#[derive(Debug, Clone)]
pub struct EligibleConversation {
    pub conversation_id: i64,
    pub last_customer_message_at: DateTime<Utc>,
    pub max_messages: i64,
}

fn webhook_status_to_str(s: SummaryWebhookStatus) -> &'static str {
    match s {
        SummaryWebhookStatus::Pending => "pending",
        SummaryWebhookStatus::Sent => "sent",
        SummaryWebhookStatus::Failed => "failed",
    }
}

fn webhook_status_from_str(s: &str) -> SummaryWebhookStatus {
    match s {
        "sent" => SummaryWebhookStatus::Sent,
        "failed" => SummaryWebhookStatus::Failed,
        _ => SummaryWebhookStatus::Pending,
    }
}

fn row_to_summary(row: &Row) -> rusqlite::Result<ConversationSummary> {
    let last_message_at: String = row.get("last_message_at")?;
    let created_at: String = row.get("created_at")?;
    let next_retry_at: Option<String> = row.get("next_retry_at")?;
    let webhook_sent_at: Option<String> = row.get("webhook_sent_at")?;
    let status: String = row.get("status")?;
    Ok(ConversationSummary {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        last_message_at: last_message_at.parse().unwrap_or_else(|_| Utc::now()),
        summary: row.get("summary")?,
        status: webhook_status_from_str(&status),
        webhook_attempts: row.get("webhook_attempts")?,
        next_retry_at: next_retry_at.map(|s| s.parse().unwrap_or_else(|_| Utc::now())),
        webhook_sent_at: webhook_sent_at.map(|s| s.parse().unwrap_or_else(|_| Utc::now())),
        webhook_last_error: row.get("webhook_last_error")?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl SchedulerStore {
    /// (I1 / P1) `UNIQUE(conversation_id, last_message_at)` makes this
    /// insert the race-resolution point: if a peer scheduler instance beat
    /// us to detecting this quiescent window, the insert fails the unique
    /// check and we treat it as "peer already did it" rather than an error.
    pub fn insert_summary(
        &self,
        conversation_id: i64,
        last_message_at: DateTime<Utc>,
        summary_text: &str,
    ) -> Result<Option<ConversationSummary>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT INTO conversation_summaries
                (conversation_id, last_message_at, summary, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![conversation_id, last_message_at.to_rfc3339(), summary_text, now],
        );
        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                drop(conn);
                Ok(Some(self.get_summary(id)?))
            }
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_summary(&self, id: i64) -> Result<ConversationSummary> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM conversation_summaries WHERE id = ?1",
            params![id],
            row_to_summary,
        )?)
    }

    /// Conversations that just became eligible for a new summary, computed
    /// in a single pass instead of looping per agent and per conversation:
    /// the agent's `summaries` thresholds (stored as JSON) and the (I1)
    /// existence check against `conversation_summaries` are both folded into
    /// the query via `json_extract`/subqueries.
    pub fn detect_eligible_conversations(&self, now: DateTime<Utc>) -> Result<Vec<EligibleConversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT
                c.id AS conversation_id,
                c.last_customer_message_at AS last_customer_message_at,
                json_extract(a.summaries_json, '$.max_messages') AS max_messages
             FROM conversations c
             JOIN agents a ON a.id = c.agent_id
             WHERE json_extract(a.summaries_json, '$.enabled') = 1
               AND c.last_customer_message_at IS NOT NULL
               AND julianday(c.last_customer_message_at)
                     <= julianday(?1) - (json_extract(a.summaries_json, '$.delay_minutes') / 1440.0)
               AND (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
                     >= json_extract(a.summaries_json, '$.min_messages')
               AND NOT EXISTS (
                     SELECT 1 FROM conversation_summaries cs
                     WHERE cs.conversation_id = c.id
                       AND cs.last_message_at = c.last_customer_message_at
                   )",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| {
            let last_customer_message_at: String = row.get("last_customer_message_at")?;
            Ok(EligibleConversation {
                conversation_id: row.get("conversation_id")?,
                last_customer_message_at: last_customer_message_at.parse().unwrap_or(now),
                max_messages: row.get("max_messages")?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rows whose webhook is pending for the first time or whose
    /// `next_retry_at` has arrived.
    pub fn due_summary_webhooks(&self, limit: i64) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversation_summaries
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit], row_to_summary)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_webhook_sent(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversation_summaries
             SET status = 'sent', webhook_sent_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Records a failed attempt and schedules the next retry, or gives up
    /// (marks `failed`) once `max_retries` is exhausted.
    pub fn record_webhook_failure(
        &self,
        id: i64,
        error: &str,
        retry_delay_secs: i64,
        max_retries: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let attempts: i64 = conn.query_row(
            "SELECT webhook_attempts FROM conversation_summaries WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        let new_attempts = attempts + 1;
        if new_attempts >= max_retries {
            conn.execute(
                "UPDATE conversation_summaries
                 SET status = 'failed', webhook_attempts = ?2, webhook_last_error = ?3
                 WHERE id = ?1",
                params![id, new_attempts, error],
            )?;
        } else {
            let next_retry = Utc::now() + chrono::Duration::seconds(retry_delay_secs);
            conn.execute(
                "UPDATE conversation_summaries
                 SET webhook_attempts = ?2, webhook_last_error = ?3, next_retry_at = ?4
                 WHERE id = ?1",
                params![id, new_attempts, error, next_retry.to_rfc3339()],
            )?;
        }
        Ok(())
    }

    pub fn get_context_summary(&self, conversation_id: i64) -> Result<Option<ConversationContextSummary>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT * FROM conversation_context_summaries WHERE conversation_id = ?1",
            params![conversation_id],
            |row| {
                let updated_at: String = row.get("updated_at")?;
                Ok(ConversationContextSummary {
                    conversation_id: row.get("conversation_id")?,
                    summary: row.get("summary")?,
                    last_message_id_covered: row.get("last_message_id_covered")?,
                    incremental_count: row.get("incremental_count")?,
                    updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
                })
            },
        ) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upsert_context_summary(
        &self,
        conversation_id: i64,
        summary: &str,
        last_message_id_covered: i64,
        incremental_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_context_summaries
                (conversation_id, summary, last_message_id_covered, incremental_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id) DO UPDATE SET
                summary = excluded.summary,
                last_message_id_covered = excluded.last_message_id_covered,
                incremental_count = excluded.incremental_count,
                updated_at = excluded.updated_at",
            params![
                conversation_id,
                summary,
                last_message_id_covered,
                incremental_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_last_message_at_is_silently_ignored() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let at = Utc::now();
        let first = store.insert_summary(1, at, "summary A").unwrap();
        let second = store.insert_summary(1, at, "summary B (peer raced us)").unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn retry_schedules_backoff_until_max_then_fails() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let summary = store.insert_summary(1, Utc::now(), "x").unwrap().unwrap();
        store.record_webhook_failure(summary.id, "timeout", 300, 3).unwrap();
        let after_one = store.get_summary(summary.id).unwrap();
        assert_eq!(after_one.status, SummaryWebhookStatus::Pending);
        assert_eq!(after_one.webhook_attempts, 1);

        store.record_webhook_failure(summary.id, "timeout", 300, 3).unwrap();
        store.record_webhook_failure(summary.id, "timeout", 300, 3).unwrap();
        let after_three = store.get_summary(summary.id).unwrap();
        assert_eq!(after_three.status, SummaryWebhookStatus::Failed);
    }

    #[test]
    fn context_summary_upsert_replaces_prior_row() {
        let store = SchedulerStore::open_in_memory().unwrap();
        store.upsert_context_summary(1, "first pass", 10, 1).unwrap();
        store.upsert_context_summary(1, "second pass", 25, 2).unwrap();
        let fetched = store.get_context_summary(1).unwrap().unwrap();
        assert_eq!(fetched.summary, "second pass");
        assert_eq!(fetched.last_message_id_covered, 25);
    }
}
