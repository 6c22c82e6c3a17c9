use rusqlite::{params, Row};

use wa_core::model::{AgentMedia, WhatsAppTemplate};

use crate::error::Result;
use crate::store::SchedulerStore;

fn row_to_template(row: &Row) -> rusqlite::Result<WhatsAppTemplate> {
    let param_keys_json: String = row.get("param_keys_json")?;
    Ok(WhatsAppTemplate {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        name: row.get("name")?,
        language: row.get("language")?,
        body: row.get("body")?,
        param_keys: serde_json::from_str(&param_keys_json).unwrap_or_default(),
    })
}

fn row_to_media(row: &Row) -> rusqlite::Result<AgentMedia> {
    Ok(AgentMedia {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        media_id: row.get("media_id")?,
        url: row.get("url")?,
        mime_type: row.get("mime_type")?,
        display_name: row.get("display_name")?,
        default_caption: row.get("default_caption")?,
        active: row.get("active")?,
    })
}

impl SchedulerStore {
    pub fn upsert_template(
        &self,
        agent_id: i64,
        name: &str,
        language: &str,
        body: &str,
        param_keys: &[String],
    ) -> Result<WhatsAppTemplate> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO whatsapp_templates (agent_id, name, language, body, param_keys_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_id, name, language) DO UPDATE SET
                body = excluded.body, param_keys_json = excluded.param_keys_json",
            params![agent_id, name, language, body, serde_json::to_string(param_keys)?],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM whatsapp_templates WHERE agent_id = ?1 AND name = ?2 AND language = ?3",
            params![agent_id, name, language],
            |r| r.get(0),
        )?;
        drop(conn);
        self.get_template(id)
    }

    pub fn get_template(&self, id: i64) -> Result<WhatsAppTemplate> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM whatsapp_templates WHERE id = ?1",
            params![id],
            row_to_template,
        )?)
    }

    pub fn find_template(&self, agent_id: i64, name: &str, language: &str) -> Result<Option<WhatsAppTemplate>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT * FROM whatsapp_templates WHERE agent_id = ?1 AND name = ?2 AND language = ?3",
            params![agent_id, name, language],
            row_to_template,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upsert_media(
        &self,
        agent_id: i64,
        media_id: &str,
        url: &str,
        mime_type: &str,
        display_name: &str,
        default_caption: Option<&str>,
    ) -> Result<AgentMedia> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agent_media (agent_id, media_id, url, mime_type, display_name, default_caption, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
             ON CONFLICT(agent_id, media_id) DO UPDATE SET
                url = excluded.url, mime_type = excluded.mime_type,
                display_name = excluded.display_name, default_caption = excluded.default_caption,
                active = 1",
            params![agent_id, media_id, url, mime_type, display_name, default_caption],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM agent_media WHERE agent_id = ?1 AND media_id = ?2",
            params![agent_id, media_id],
            |r| r.get(0),
        )?;
        drop(conn);
        self.get_media(id)
    }

    pub fn get_media(&self, id: i64) -> Result<AgentMedia> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT * FROM agent_media WHERE id = ?1", params![id], row_to_media)?)
    }

    pub fn list_active_media(&self, agent_id: i64) -> Result<Vec<AgentMedia>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM agent_media WHERE agent_id = ?1 AND active = 1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_media)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_media_by_media_id(&self, agent_id: i64, media_id: &str) -> Result<Option<AgentMedia>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT * FROM agent_media WHERE agent_id = ?1 AND media_id = ?2",
            params![agent_id, media_id],
            row_to_media,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_template_replaces_body_on_conflict() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let first = store
            .upsert_template(1, "reminder_he", "he", "שלום {{1}}", &["name".into()])
            .unwrap();
        let second = store
            .upsert_template(1, "reminder_he", "he", "היי {{1}}", &["name".into()])
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.body, "היי {{1}}");
    }

    #[test]
    fn list_active_media_excludes_inactive_rows() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agent_media (agent_id, media_id, url, mime_type, display_name, active)
             VALUES (1, 'm1', 'https://x', 'image/png', 'Brochure', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO agent_media (agent_id, media_id, url, mime_type, display_name, active)
             VALUES (1, 'm2', 'https://y', 'image/png', 'Old flyer', 0)",
            [],
        )
        .unwrap();
        drop(conn);

        let active = store.list_active_media(1).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].media_id, "m1");
    }
}
