//! The `Orchestrator` binds every dependency the Conversation Orchestrator
//! (C3) needs and is the concrete `wa_batcher::BatchFlushHandler` the
//! gateway registers with the `Batcher`. One instance is shared (behind
//! `Arc`) across every inbound webhook and every batch flush.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;
use wa_batcher::{BatchFlushHandler, PendingMessage};
use wa_core::kv::SharedStore;
use wa_scheduler::SchedulerStore;
use wa_store::Store;
use wa_users::ConversationResolver;

use crate::runtime::AgentRuntime;
use crate::sender::SenderFactory;

pub struct Orchestrator {
    pub(crate) store: Arc<Store>,
    pub(crate) scheduler_store: Arc<SchedulerStore>,
    pub(crate) resolver: Arc<ConversationResolver>,
    pub(crate) runtime: Arc<AgentRuntime>,
    pub(crate) senders: Arc<SenderFactory>,
    pub(crate) shared: Arc<dyn SharedStore>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        scheduler_store: Arc<SchedulerStore>,
        resolver: Arc<ConversationResolver>,
        runtime: Arc<AgentRuntime>,
        senders: Arc<SenderFactory>,
        shared: Arc<dyn SharedStore>,
    ) -> Self {
        Self { store, scheduler_store, resolver, runtime, senders, shared }
    }
}

#[async_trait]
impl BatchFlushHandler for Orchestrator {
    async fn on_flush(&self, agent_id: i64, user_phone: &str, messages: Vec<PendingMessage>) {
        if let Err(e) = super::process::handle_batch(self, agent_id, user_phone, messages).await {
            error!(agent_id, user_phone, error = %e, "orchestrator: turn failed");
        }
    }
}
