use chrono::Utc;
use rusqlite::{params, Row};

use wa_core::model::Conversation;

use crate::agents::parse_ts;
use crate::error::{Error, Result};
use crate::store::Store;

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_customer_message_at: Option<String> = row.get("last_customer_message_at")?;
    Ok(Conversation {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        user_id: row.get("user_id")?,
        paused: row.get("paused")?,
        opted_out: row.get("opted_out")?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_customer_message_at: last_customer_message_at.map(|s| parse_ts(&s)),
    })
}

impl Store {
    /// (I1) one conversation per (agent, user) pair, created lazily on first
    /// inbound message.
    pub fn find_or_create_conversation(&self, agent_id: i64, user_id: i64) -> Result<Conversation> {
        if let Some(conv) = self.find_conversation(agent_id, user_id)? {
            return Ok(conv);
        }
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO conversations (agent_id, user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(agent_id, user_id) DO NOTHING",
            params![agent_id, user_id, now],
        )?;
        drop(conn);
        self.find_conversation(agent_id, user_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {agent_id}/{user_id}")))
    }

    pub fn find_conversation(&self, agent_id: i64, user_id: i64) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT * FROM conversations WHERE agent_id = ?1 AND user_id = ?2",
            params![agent_id, user_id],
            row_to_conversation,
        ) {
            Ok(conv) => Ok(Some(conv)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    pub fn get_conversation(&self, id: i64) -> Result<Conversation> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("conversation {id}")),
            other => Error::Database(other),
        })
    }

    /// (I2) clearing `opted_out` happens only on a fresh inbound message,
    /// never automatically by the scheduler or an outbound send.
    pub fn touch_inbound(&self, id: i64, at: chrono::DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversations
             SET opted_out = 0, last_customer_message_at = ?2, updated_at = ?2
             WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_paused(&self, id: i64, paused: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversations SET paused = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, paused, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_opted_out(&self, id: i64, opted_out: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversations SET opted_out = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, opted_out, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn seed(store: &Store) -> (i64, i64) {
        let agent = store
            .create_agent("Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet")
            .unwrap();
        let user = store.find_or_create_user_by_phone("+972500000009").unwrap();
        (agent.id, user.id)
    }

    #[test]
    fn find_or_create_is_idempotent_per_pair() {
        let store = Store::open_in_memory().unwrap();
        let (agent_id, user_id) = seed(&store);
        let a = store.find_or_create_conversation(agent_id, user_id).unwrap();
        let b = store.find_or_create_conversation(agent_id, user_id).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn touch_inbound_clears_opted_out() {
        let store = Store::open_in_memory().unwrap();
        let (agent_id, user_id) = seed(&store);
        let conv = store.find_or_create_conversation(agent_id, user_id).unwrap();
        store.set_opted_out(conv.id, true).unwrap();
        store.touch_inbound(conv.id, Utc::now()).unwrap();
        let fetched = store.get_conversation(conv.id).unwrap();
        assert!(!fetched.opted_out);
        assert!(fetched.last_customer_message_at.is_some());
    }

    #[test]
    fn paused_and_opted_out_both_block_outbound() {
        let store = Store::open_in_memory().unwrap();
        let (agent_id, user_id) = seed(&store);
        let conv = store.find_or_create_conversation(agent_id, user_id).unwrap();
        store.set_paused(conv.id, true).unwrap();
        let fetched = store.get_conversation(conv.id).unwrap();
        assert!(fetched.blocks_outbound());
    }
}
