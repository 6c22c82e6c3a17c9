//! Time-driven tables: appointments, reminders, summaries, follow-ups,
//! templates, and media. Owned here (rather than `wa-store`) because the
//! scheduler engine is their primary reader/writer and their state machines
//! are tightly coupled to its tick cycle.

use rusqlite::Connection;

use crate::error::Result;

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS appointments (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id            INTEGER NOT NULL,
            user_id             INTEGER NOT NULL,
            start_at            TEXT NOT NULL,
            end_at              TEXT NOT NULL,
            title               TEXT NOT NULL,
            description         TEXT,
            status              TEXT NOT NULL DEFAULT 'scheduled',
            external_event_id   TEXT,
            created_at          TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_appointments_agent_window
            ON appointments(agent_id, start_at, end_at);
         CREATE INDEX IF NOT EXISTS idx_appointments_user ON appointments(user_id);

         CREATE TABLE IF NOT EXISTS scheduled_reminders (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            appointment_id  INTEGER NOT NULL,
            agent_id        INTEGER NOT NULL,
            user_id         INTEGER NOT NULL,
            scheduled_for   TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            content_type    TEXT NOT NULL DEFAULT 'template',
            template        TEXT,
            ai_prompt       TEXT,
            rule_index      INTEGER NOT NULL,
            sent_at         TEXT,
            error_message   TEXT,
            created_at      TEXT NOT NULL,
            UNIQUE(appointment_id, rule_index)
         );
         CREATE INDEX IF NOT EXISTS idx_reminders_due
            ON scheduled_reminders(status, scheduled_for);

         CREATE TABLE IF NOT EXISTS conversation_summaries (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id     INTEGER NOT NULL,
            last_message_at     TEXT NOT NULL,
            summary             TEXT NOT NULL,
            status              TEXT NOT NULL DEFAULT 'pending',
            webhook_attempts    INTEGER NOT NULL DEFAULT 0,
            next_retry_at       TEXT,
            webhook_sent_at     TEXT,
            webhook_last_error  TEXT,
            created_at          TEXT NOT NULL,
            UNIQUE(conversation_id, last_message_at)
         );
         CREATE INDEX IF NOT EXISTS idx_summaries_retry
            ON conversation_summaries(status, next_retry_at);

         CREATE TABLE IF NOT EXISTS conversation_context_summaries (
            conversation_id         INTEGER PRIMARY KEY,
            summary                 TEXT NOT NULL,
            last_message_id_covered INTEGER NOT NULL DEFAULT 0,
            incremental_count       INTEGER NOT NULL DEFAULT 0,
            updated_at              TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS scheduled_followups (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id     INTEGER NOT NULL,
            agent_id            INTEGER NOT NULL,
            user_id             INTEGER NOT NULL,
            followup_number     INTEGER NOT NULL,
            step_instruction    TEXT NOT NULL,
            scheduled_for       TEXT NOT NULL,
            status              TEXT NOT NULL DEFAULT 'pending',
            content             TEXT,
            ai_reason           TEXT,
            sent_via            TEXT,
            template_name       TEXT,
            sent_at             TEXT,
            created_at          TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_followups_due
            ON scheduled_followups(status, scheduled_for);
         CREATE INDEX IF NOT EXISTS idx_followups_conversation
            ON scheduled_followups(conversation_id, status);

         CREATE TABLE IF NOT EXISTS whatsapp_templates (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id    INTEGER NOT NULL,
            name        TEXT NOT NULL,
            language    TEXT NOT NULL,
            body        TEXT NOT NULL,
            param_keys_json TEXT NOT NULL DEFAULT '[]',
            UNIQUE(agent_id, name, language)
         );

         CREATE TABLE IF NOT EXISTS agent_media (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id        INTEGER NOT NULL,
            media_id        TEXT NOT NULL,
            url             TEXT NOT NULL,
            mime_type       TEXT NOT NULL,
            display_name    TEXT NOT NULL,
            default_caption TEXT,
            active          INTEGER NOT NULL DEFAULT 1,
            UNIQUE(agent_id, media_id)
         );
         CREATE INDEX IF NOT EXISTS idx_agent_media_agent ON agent_media(agent_id, active);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
