use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;
use wa_core::model::{Conversation, User};
use wa_store::Store;

use crate::error::Result;

/// Maximum number of (agent_id, phone) -> conversation_id pairs kept in the
/// in-process cache. Simple eviction: when full, drop the oldest half.
const CACHE_MAX: usize = 512;

/// Outcome of resolving an inbound (agent, phone) pair.
#[derive(Debug)]
pub struct ResolvedConversation {
    pub user: User,
    pub conversation: Conversation,
    pub is_new_conversation: bool,
}

/// Translates inbound webhook identities (agent + phone number) into the
/// `User`/`Conversation` rows the orchestrator operates on.
///
/// Hot path: every inbound message calls `resolve()`. The (agent_id, phone)
/// -> conversation_id mapping is cached in memory to avoid two DB round
/// trips (user lookup, conversation lookup) on every message from a
/// customer we already know about.
pub struct ConversationResolver {
    store: Arc<Store>,
    cache: Mutex<HashMap<(i64, String), i64>>,
    cache_order: Mutex<Vec<(i64, String)>>,
}

impl ConversationResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            cache_order: Mutex::new(Vec::new()),
        }
    }

    /// Resolve (agent_id, phone) to a user + conversation, creating both
    /// lazily on first contact (I1). Does not record the inbound message
    /// timestamp — callers that are handling a genuine inbound message
    /// should follow up with `mark_inbound`.
    pub fn resolve(&self, agent_id: i64, phone: &str) -> Result<ResolvedConversation> {
        let key = (agent_id, phone.to_string());

        if let Some(conversation_id) = self.cache_lookup(&key) {
            debug!(agent_id, phone, conversation_id, "conversation cache hit");
            if let Ok(conversation) = self.store.get_conversation(conversation_id) {
                let user = self.store.get_user(conversation.user_id)?;
                return Ok(ResolvedConversation {
                    user,
                    conversation,
                    is_new_conversation: false,
                });
            }
            self.cache_remove(&key);
        }

        let user = self.store.find_or_create_user_by_phone(phone)?;
        let existed = self.store.find_conversation(agent_id, user.id)?.is_some();
        let conversation = self.store.find_or_create_conversation(agent_id, user.id)?;
        self.cache_insert(key, conversation.id);

        Ok(ResolvedConversation {
            user,
            conversation,
            is_new_conversation: !existed,
        })
    }

    /// (I2) Record a fresh inbound message: clears `opted_out` and updates
    /// `last_customer_message_at`. Must be called once per genuine inbound
    /// message, never for system-originated writes (reminders, follow-ups).
    pub fn mark_inbound(&self, conversation_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.store.touch_inbound(conversation_id, at)?;
        Ok(())
    }

    pub fn set_paused(&self, conversation_id: i64, paused: bool) -> Result<()> {
        self.store.set_paused(conversation_id, paused)?;
        Ok(())
    }

    pub fn set_opted_out(&self, conversation_id: i64, opted_out: bool) -> Result<()> {
        self.store.set_opted_out(conversation_id, opted_out)?;
        Ok(())
    }

    /// Drop the cache entry for a specific (agent, phone) pair. Call this
    /// after any out-of-band mutation (e.g. a manual merge) that could leave
    /// the cached conversation id stale.
    pub fn invalidate(&self, agent_id: i64, phone: &str) {
        self.cache_remove(&(agent_id, phone.to_string()));
    }

    // cache helpers

    fn cache_lookup(&self, key: &(i64, String)) -> Option<i64> {
        self.cache.lock().unwrap().get(key).copied()
    }

    fn cache_remove(&self, key: &(i64, String)) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();
        cache.remove(key);
        order.retain(|k| k != key);
    }

    fn cache_insert(&self, key: (i64, String), conversation_id: i64) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();

        if let std::collections::hash_map::Entry::Occupied(mut e) = cache.entry(key.clone()) {
            e.insert(conversation_id);
            return;
        }

        if cache.len() >= CACHE_MAX {
            let evict_count = CACHE_MAX / 2;
            let to_remove: Vec<_> = order.drain(..evict_count).collect();
            for k in to_remove {
                cache.remove(&k);
            }
        }

        order.push(key.clone());
        cache.insert(key, conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn seed_agent(store: &Store) -> i64 {
        store
            .create_agent("Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet")
            .unwrap()
            .id
    }

    #[test]
    fn resolve_creates_user_and_conversation_on_first_contact() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let agent_id = seed_agent(&store);
        let resolver = ConversationResolver::new(store);

        let resolved = resolver.resolve(agent_id, "+972501234567").unwrap();
        assert!(resolved.is_new_conversation);
        assert_eq!(resolved.user.phone, "+972501234567");
    }

    #[test]
    fn resolve_is_idempotent_and_uses_cache_on_second_call() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let agent_id = seed_agent(&store);
        let resolver = ConversationResolver::new(store);

        let first = resolver.resolve(agent_id, "+972501234567").unwrap();
        let second = resolver.resolve(agent_id, "+972501234567").unwrap();
        assert_eq!(first.conversation.id, second.conversation.id);
        assert!(!second.is_new_conversation);
    }

    #[test]
    fn mark_inbound_clears_opted_out() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let agent_id = seed_agent(&store);
        let resolver = ConversationResolver::new(store);

        let resolved = resolver.resolve(agent_id, "+972501234567").unwrap();
        resolver.set_opted_out(resolved.conversation.id, true).unwrap();
        resolver.mark_inbound(resolved.conversation.id, Utc::now()).unwrap();

        let again = resolver.resolve(agent_id, "+972501234567").unwrap();
        assert!(!again.conversation.opted_out);
    }
}
