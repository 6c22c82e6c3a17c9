//! Operator-curated knowledge base backing the `search_knowledge` tool.
//!
//! Entries are topic-keyed text blobs, searched with a simple `LIKE` scan
//! over topic/content/tags. No FTS5 — the catalog per agent is small enough
//! that a substring scan is plenty, and it avoids pulling the `fts5` sqlite
//! compile feature into every deployment.

use rusqlite::{params, Row};

use wa_core::model::KnowledgeEntry;

use crate::error::Result;
use crate::store::Store;

fn row_to_entry(row: &Row) -> rusqlite::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        topic: row.get("topic")?,
        content: row.get("content")?,
        tags: row.get("tags")?,
    })
}

impl Store {
    pub fn upsert_knowledge(
        &self,
        agent_id: i64,
        topic: &str,
        content: &str,
        tags: &str,
    ) -> Result<KnowledgeEntry> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO knowledge (agent_id, topic, content, tags)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id, topic) DO UPDATE SET
                content = excluded.content, tags = excluded.tags",
            params![agent_id, topic, content, tags],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM knowledge WHERE agent_id = ?1 AND topic = ?2",
            params![agent_id, topic],
            |r| r.get(0),
        )?;
        drop(conn);
        self.get_knowledge(id)
    }

    pub fn get_knowledge(&self, id: i64) -> Result<KnowledgeEntry> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM knowledge WHERE id = ?1",
            params![id],
            row_to_entry,
        )?)
    }

    /// `agent`'s knowledge count — used by the prompt assembler to decide
    /// whether to enumerate documents directly or describe them by count.
    pub fn count_knowledge(&self, agent_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM knowledge WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )?)
    }

    pub fn list_knowledge_topics(&self, agent_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT topic FROM knowledge WHERE agent_id = ?1 ORDER BY topic")?;
        let rows = stmt.query_map(params![agent_id], |r| r.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn search_knowledge(&self, agent_id: i64, query: &str, limit: i64) -> Result<Vec<KnowledgeEntry>> {
        let pattern = format!("%{}%", query.replace('%', "").replace('_', ""));
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM knowledge
             WHERE agent_id = ?1 AND (topic LIKE ?2 OR content LIKE ?2 OR tags LIKE ?2)
             ORDER BY topic LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![agent_id, pattern, limit], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_is_idempotent_per_topic() {
        let store = Store::open_in_memory().unwrap();
        let a = store.upsert_knowledge(1, "hours", "Open 9-5", "").unwrap();
        let b = store.upsert_knowledge(1, "hours", "Open 9-6", "").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.get_knowledge(b.id).unwrap().content, "Open 9-6");
    }

    #[test]
    fn search_matches_content_substring() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_knowledge(1, "returns", "30 day return policy", "policy").unwrap();
        store.upsert_knowledge(1, "shipping", "ships within 2 days", "logistics").unwrap();
        let found = store.search_knowledge(1, "return", 5).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, "returns");
    }
}
