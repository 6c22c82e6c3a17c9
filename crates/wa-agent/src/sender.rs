//! Picks the outbound `WhatsAppSender` for an agent from its configured
//! `provider` + `credentials` (§4.1/§6). One `reqwest::Client` is shared
//! across every sender instance the factory builds, matching the teacher's
//! "one client per process" pattern for its own HTTP-backed channels.

use std::sync::Arc;

use wa_core::model::Agent;
use wa_providers::meta::MetaSender;
use wa_providers::traits::WhatsAppSender;
use wa_providers::wasender::WaSenderSender;

use crate::error::{AgentError, Result};

pub struct SenderFactory {
    client: reqwest::Client,
}

impl SenderFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a fresh sender for this agent's configured provider. Cheap
    /// enough to call per-turn: both senders are thin wrappers around the
    /// shared `reqwest::Client`, not long-lived connections.
    pub fn sender_for(&self, agent: &Agent) -> Result<Arc<dyn WhatsAppSender>> {
        match agent.provider {
            wa_core::model::WhatsAppProvider::Meta => {
                let creds = agent.credentials.meta.clone().ok_or_else(|| {
                    AgentError::Validation(format!("agent {} has no meta credentials configured", agent.id))
                })?;
                Ok(Arc::new(MetaSender::new(self.client.clone(), creds)))
            }
            wa_core::model::WhatsAppProvider::Wasender => {
                let creds = agent.credentials.wasender.clone().ok_or_else(|| {
                    AgentError::Validation(format!("agent {} has no wasender credentials configured", agent.id))
                })?;
                Ok(Arc::new(WaSenderSender::new(self.client.clone(), creds)))
            }
        }
    }
}
