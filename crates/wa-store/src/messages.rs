use chrono::Utc;
use rusqlite::{params, Row};

use wa_core::model::{Message, MessageContentType, MessageRole};

use crate::agents::parse_ts;
use crate::error::Result;
use crate::store::Store;

fn role_to_str(r: MessageRole) -> &'static str {
    match r {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_str(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        _ => MessageRole::User,
    }
}

fn content_type_to_str(t: MessageContentType) -> &'static str {
    match t {
        MessageContentType::Text => "text",
        MessageContentType::Voice => "voice",
        MessageContentType::Image => "image",
        MessageContentType::Media => "media",
        MessageContentType::Reminder => "reminder",
        MessageContentType::Followup => "followup",
        MessageContentType::Manual => "manual",
    }
}

fn content_type_from_str(s: &str) -> MessageContentType {
    match s {
        "voice" => MessageContentType::Voice,
        "image" => MessageContentType::Image,
        "media" => MessageContentType::Media,
        "reminder" => MessageContentType::Reminder,
        "followup" => MessageContentType::Followup,
        "manual" => MessageContentType::Manual,
        _ => MessageContentType::Text,
    }
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    let content_type: String = row.get("content_type")?;
    let created_at: String = row.get("created_at")?;
    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        role: role_from_str(&role),
        content_type: content_type_from_str(&content_type),
        content: row.get("content")?,
        media_id: row.get("media_id")?,
        media_url: row.get("media_url")?,
        created_at: parse_ts(&created_at),
    })
}

pub struct NewMessage<'a> {
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content_type: MessageContentType,
    pub content: &'a str,
    pub media_id: Option<&'a str>,
    pub media_url: Option<&'a str>,
}

impl Store {
    pub fn append_message(&self, msg: NewMessage<'_>) -> Result<Message> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO messages
                (conversation_id, role, content_type, content, media_id, media_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.conversation_id,
                role_to_str(msg.role),
                content_type_to_str(msg.content_type),
                msg.content,
                msg.media_id,
                msg.media_url,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_message(id)
    }

    pub fn get_message(&self, id: i64) -> Result<Message> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )?)
    }

    /// Last `limit` messages for a conversation, oldest first — the shape
    /// the LLM context builder and the context-summary engine both want.
    pub fn recent_messages(&self, conversation_id: i64, limit: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Messages strictly after `after_id`, oldest first — used for
    /// incremental context-summary passes.
    pub fn messages_after(&self, conversation_id: i64, after_id: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE conversation_id = ?1 AND id > ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id, after_id], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_messages(&self, conversation_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |r| r.get(0),
        )?)
    }

    /// Whether `media_id` was already sent (as a `media`-typed assistant
    /// message) anywhere in this conversation — backs `send_media`'s
    /// `allow_duplicate_in_conversation == false` rejection.
    pub fn media_already_sent(&self, conversation_id: i64, media_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND content_type = 'media' AND media_id = ?2",
            params![conversation_id, media_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn seed_conversation(store: &Store) -> i64 {
        let agent = store
            .create_agent("Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet")
            .unwrap();
        let user = store.find_or_create_user_by_phone("+972500000010").unwrap();
        store.find_or_create_conversation(agent.id, user.id).unwrap().id
    }

    #[test]
    fn append_and_fetch_recent_preserves_order() {
        let store = Store::open_in_memory().unwrap();
        let conv_id = seed_conversation(&store);
        for i in 0..5 {
            store
                .append_message(NewMessage {
                    conversation_id: conv_id,
                    role: MessageRole::User,
                    content_type: MessageContentType::Text,
                    content: &format!("msg {i}"),
                    media_id: None,
                    media_url: None,
                })
                .unwrap();
        }
        let recent = store.recent_messages(conv_id, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "msg 2");
        assert_eq!(recent[2].content, "msg 4");
    }

    #[test]
    fn messages_after_only_returns_newer_rows() {
        let store = Store::open_in_memory().unwrap();
        let conv_id = seed_conversation(&store);
        let first = store
            .append_message(NewMessage {
                conversation_id: conv_id,
                role: MessageRole::User,
                content_type: MessageContentType::Text,
                content: "first",
                media_id: None,
                media_url: None,
            })
            .unwrap();
        store
            .append_message(NewMessage {
                conversation_id: conv_id,
                role: MessageRole::Assistant,
                content_type: MessageContentType::Text,
                content: "second",
                media_id: None,
                media_url: None,
            })
            .unwrap();
        let after = store.messages_after(conv_id, first.id).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "second");
    }

    #[test]
    fn count_messages_matches_inserts() {
        let store = Store::open_in_memory().unwrap();
        let conv_id = seed_conversation(&store);
        assert_eq!(store.count_messages(conv_id).unwrap(), 0);
        store
            .append_message(NewMessage {
                conversation_id: conv_id,
                role: MessageRole::User,
                content_type: MessageContentType::Text,
                content: "hi",
                media_id: None,
                media_url: None,
            })
            .unwrap();
        assert_eq!(store.count_messages(conv_id).unwrap(), 1);
    }
}
