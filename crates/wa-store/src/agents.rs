use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use wa_core::model::{
    Agent, BatchingConfig, CalendarConfig, ContextSummaryConfig, FollowupsConfig, MediaConfig,
    ProviderCredentials, RemindersConfig, SummariesConfig, WhatsAppProvider,
};

use crate::error::{Error, Result};
use crate::store::Store;

fn provider_to_str(p: WhatsAppProvider) -> &'static str {
    match p {
        WhatsAppProvider::Meta => "meta",
        WhatsAppProvider::Wasender => "wasender",
    }
}

fn provider_from_str(s: &str) -> WhatsAppProvider {
    match s {
        "meta" => WhatsAppProvider::Meta,
        _ => WhatsAppProvider::Wasender,
    }
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    let credentials_json: String = row.get("credentials_json")?;
    let custom_keys_json: String = row.get("custom_api_keys_json")?;
    let batching_json: String = row.get("batching_json")?;
    let calendar_json: String = row.get("calendar_json")?;
    let reminders_json: String = row.get("reminders_json")?;
    let summaries_json: String = row.get("summaries_json")?;
    let followups_json: String = row.get("followups_json")?;
    let media_json: String = row.get("media_json")?;
    let context_summary_json: String = row.get("context_summary_json")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let provider: String = row.get("provider")?;

    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        active: row.get("active")?,
        provider: provider_from_str(&provider),
        credentials: serde_json::from_str::<ProviderCredentials>(&credentials_json)
            .unwrap_or_default(),
        llm_model: row.get("llm_model")?,
        custom_api_keys: serde_json::from_str(&custom_keys_json).unwrap_or_default(),
        system_prompt: row.get("system_prompt")?,
        timezone: row.get("timezone")?,
        batching: serde_json::from_str::<BatchingConfig>(&batching_json).unwrap_or_default(),
        calendar: serde_json::from_str::<CalendarConfig>(&calendar_json).unwrap_or_default(),
        reminders: serde_json::from_str::<RemindersConfig>(&reminders_json).unwrap_or_default(),
        summaries: serde_json::from_str::<SummariesConfig>(&summaries_json).unwrap_or_default(),
        followups: serde_json::from_str::<FollowupsConfig>(&followups_json).unwrap_or_default(),
        media: serde_json::from_str::<MediaConfig>(&media_json).unwrap_or_default(),
        context_summary: serde_json::from_str::<ContextSummaryConfig>(&context_summary_json)
            .unwrap_or_default(),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn create_agent(&self, name: &str, provider: WhatsAppProvider, llm_model: &str) -> Result<Agent> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO agents (name, active, provider, llm_model, created_at, updated_at)
             VALUES (?1, 1, ?2, ?3, ?4, ?4)",
            params![name, provider_to_str(provider), llm_model, now],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_agent(id)
    }

    pub fn get_agent(&self, id: i64) -> Result<Agent> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM agents WHERE id = ?1", params![id], row_to_agent)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Error::NotFound(format!("agent {id}"))
                }
                other => Error::Database(other),
            })
    }

    pub fn list_active_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM agents WHERE active = 1")?;
        let rows = stmt.query_map([], row_to_agent)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_agent_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Agent>> {
        for agent in self.list_active_agents()? {
            if let Some(meta) = &agent.credentials.meta {
                if meta.phone_number_id == phone_number_id {
                    return Ok(Some(agent));
                }
            }
        }
        Ok(None)
    }

    pub fn find_agent_by_wasender_session(&self, session: &str) -> Result<Option<Agent>> {
        for agent in self.list_active_agents()? {
            if let Some(wasender) = &agent.credentials.wasender {
                if wasender.session == session {
                    return Ok(Some(agent));
                }
            }
        }
        Ok(None)
    }

    pub fn add_token_usage(&self, agent_id: i64, input_tokens: i64, output_tokens: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE agents
             SET input_tokens_total = input_tokens_total + ?2,
                 output_tokens_total = output_tokens_total + ?3,
                 updated_at = ?4
             WHERE id = ?1",
            params![agent_id, input_tokens, output_tokens, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_agent_configs(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE agents SET
                batching_json = ?2,
                calendar_json = ?3,
                reminders_json = ?4,
                summaries_json = ?5,
                followups_json = ?6,
                media_json = ?7,
                context_summary_json = ?8,
                updated_at = ?9
             WHERE id = ?1",
            params![
                agent.id,
                serde_json::to_string(&agent.batching)?,
                serde_json::to_string(&agent.calendar)?,
                serde_json::to_string(&agent.reminders)?,
                serde_json::to_string(&agent.summaries)?,
                serde_json::to_string(&agent.followups)?,
                serde_json::to_string(&agent.media)?,
                serde_json::to_string(&agent.context_summary)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

/// Parse an RFC3339 timestamp column, defaulting to "now" only as a last
/// resort for rows written before a column existed.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_agent_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let agent = store
            .create_agent("Clinic Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet")
            .unwrap();
        assert_eq!(agent.name, "Clinic Bot");
        assert!(agent.active);

        let fetched = store.get_agent(agent.id).unwrap();
        assert_eq!(fetched.id, agent.id);
        assert_eq!(fetched.llm_model, "claude-3-5-sonnet");
    }

    #[test]
    fn missing_agent_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.get_agent(999), Err(Error::NotFound(_))));
    }

    #[test]
    fn token_usage_accumulates() {
        let store = Store::open_in_memory().unwrap();
        let agent = store
            .create_agent("Bot", WhatsAppProvider::Wasender, "gpt-4o")
            .unwrap();
        store.add_token_usage(agent.id, 100, 50).unwrap();
        store.add_token_usage(agent.id, 20, 10).unwrap();
        let conn = store.conn.lock().unwrap();
        let (input, output): (i64, i64) = conn
            .query_row(
                "SELECT input_tokens_total, output_tokens_total FROM agents WHERE id = ?1",
                params![agent.id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(input, 120);
        assert_eq!(output, 60);
    }
}
