//! Core conversational tables: agents, users, conversations, messages, and
//! the persisted dedup ledger. Safe to call on every startup (idempotent).

use rusqlite::Connection;

use crate::error::Result;

pub fn init_db(conn: &Connection) -> Result<()> {
    create_agents_table(conn)?;
    create_users_table(conn)?;
    create_conversations_table(conn)?;
    create_messages_table(conn)?;
    create_processed_messages_table(conn)?;
    create_knowledge_table(conn)?;
    create_products_table(conn)?;
    Ok(())
}

fn create_agents_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agents (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            name                TEXT NOT NULL,
            active              INTEGER NOT NULL DEFAULT 1,
            provider            TEXT NOT NULL,
            credentials_json    TEXT NOT NULL DEFAULT '{}',
            llm_model           TEXT NOT NULL,
            custom_api_keys_json TEXT NOT NULL DEFAULT '{}',
            system_prompt       TEXT NOT NULL DEFAULT '',
            timezone            TEXT NOT NULL DEFAULT 'Asia/Jerusalem',
            batching_json       TEXT NOT NULL DEFAULT '{}',
            calendar_json       TEXT NOT NULL DEFAULT '{}',
            reminders_json      TEXT NOT NULL DEFAULT '{}',
            summaries_json      TEXT NOT NULL DEFAULT '{}',
            followups_json      TEXT NOT NULL DEFAULT '{}',
            media_json          TEXT NOT NULL DEFAULT '{}',
            context_summary_json TEXT NOT NULL DEFAULT '{}',
            input_tokens_total  INTEGER NOT NULL DEFAULT 0,
            output_tokens_total INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
         );",
    )?;
    Ok(())
}

fn create_users_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            phone           TEXT NOT NULL UNIQUE,
            display_name    TEXT,
            gender          TEXT NOT NULL DEFAULT 'unknown',
            metadata_json   TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_users_phone ON users(phone);",
    )?;
    Ok(())
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id                          INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id                    INTEGER NOT NULL,
            user_id                     INTEGER NOT NULL,
            paused                      INTEGER NOT NULL DEFAULT 0,
            opted_out                   INTEGER NOT NULL DEFAULT 0,
            last_customer_message_at    TEXT,
            created_at                  TEXT NOT NULL,
            updated_at                  TEXT NOT NULL,
            UNIQUE(agent_id, user_id)
         );
         CREATE INDEX IF NOT EXISTS idx_conversations_agent ON conversations(agent_id);
         CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);",
    )?;
    Ok(())
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id     INTEGER NOT NULL,
            role                TEXT NOT NULL,
            content_type        TEXT NOT NULL DEFAULT 'text',
            content             TEXT NOT NULL,
            media_id            TEXT,
            media_url           TEXT,
            created_at          TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, id);",
    )?;
    Ok(())
}

fn create_processed_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS processed_messages (
            dedup_key   TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_processed_messages_created
            ON processed_messages(created_at);",
    )?;
    Ok(())
}

fn create_knowledge_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id    INTEGER NOT NULL,
            topic       TEXT NOT NULL,
            content     TEXT NOT NULL,
            tags        TEXT NOT NULL DEFAULT '',
            UNIQUE(agent_id, topic)
         );
         CREATE INDEX IF NOT EXISTS idx_knowledge_agent ON knowledge(agent_id);",
    )?;
    Ok(())
}

fn create_products_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS products (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id    INTEGER NOT NULL,
            name        TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            price       REAL NOT NULL DEFAULT 0,
            sku         TEXT,
            active      INTEGER NOT NULL DEFAULT 1
         );
         CREATE INDEX IF NOT EXISTS idx_products_agent ON products(agent_id);",
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
