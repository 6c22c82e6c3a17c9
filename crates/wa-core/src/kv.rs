//! The narrow shared-state interface behind which all cross-instance
//! coordination lives: dedup cache, distributed batch buffers, the scheduler
//! leadership lock, follow-up timers, and the context-summary lock.
//!
//! A production deployment backs this with Redis or similar; the
//! `DashMapStore` below is the degraded/single-instance implementation and
//! also doubles as the default for a lone instance, matching the spec's
//! requirement that store-unavailability degrade gracefully rather than fail.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Outcome of a set-if-absent lease/gate acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Acquired,
    HeldByOther,
}

/// The six coordination primitives named by the design notes. Any store
/// implementing this trait is a valid backend — the core never talks to
/// Redis (or anything else) directly.
pub trait SharedStore: Send + Sync {
    /// Atomically insert a dedup key. Returns `true` if this call inserted it
    /// (first time seen), `false` if it already existed (duplicate).
    fn increment_dedup(&self, key: &str, ttl: Duration) -> bool;

    /// Try to acquire the per-(agent,user) batch-drain gate. Only the winner
    /// should drain the buffer for this tick.
    fn claim_batch_drain(&self, pair_key: &str, ttl: Duration) -> Claim;

    /// Push a timer member with the given absolute fire time (as a unix
    /// timestamp score) onto a named sorted-set.
    fn enqueue_timer(&self, set_name: &str, member: &str, fire_at_unix: i64);

    /// Atomically remove and return every timer member whose score is
    /// `<= now_unix`. Each returned member is claimed by the caller alone.
    fn drain_due_timers(&self, set_name: &str, now_unix: i64) -> Vec<String>;

    /// Remove a specific timer member before its score is reached (used when
    /// a customer re-engages and cancels a pending follow-up timer).
    fn remove_timer(&self, set_name: &str, member: &str);

    /// Try to become the scheduler leader for one cycle.
    fn acquire_scheduler_lease(&self, ttl: Duration) -> Claim;

    /// Try to acquire the per-conversation context-summary lock.
    fn acquire_conv_lease(&self, conversation_key: &str, ttl: Duration) -> Claim;
}

struct Lease {
    expires_at: Instant,
}

struct SortedSet {
    members: Vec<(String, i64)>,
}

/// In-process implementation backed by `DashMap`. This is both the
/// "shared store" used by a single instance and the fallback mode a
/// distributed backend degrades to when unreachable.
pub struct DashMapStore {
    dedup: DashMap<String, Instant>,
    leases: DashMap<String, Lease>,
    timers: DashMap<String, SortedSet>,
}

impl Default for DashMapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DashMapStore {
    pub fn new() -> Self {
        Self {
            dedup: DashMap::new(),
            leases: DashMap::new(),
            timers: DashMap::new(),
        }
    }

    /// Opportunistic cleanup of expired dedup keys. The spec calls for a
    /// "probabilistic, small fraction of inserts" sweep rather than a
    /// background thread; callers invoke this after `increment_dedup` with
    /// their own sampling policy (see `wa-providers`' dispatcher).
    pub fn sweep_expired_dedup(&self) {
        let now = Instant::now();
        self.dedup.retain(|_, expires_at| *expires_at > now);
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Claim {
        let now = Instant::now();
        let expires_at = now + ttl;
        match self.leases.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Lease { expires_at });
                Claim::Acquired
            }
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().expires_at <= now {
                    e.insert(Lease { expires_at });
                    Claim::Acquired
                } else {
                    Claim::HeldByOther
                }
            }
        }
    }
}

impl SharedStore for DashMapStore {
    fn increment_dedup(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.dedup.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(now + ttl);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(_) => false,
        }
    }

    fn claim_batch_drain(&self, pair_key: &str, ttl: Duration) -> Claim {
        self.try_acquire(&format!("msg_lock:{pair_key}"), ttl)
    }

    fn enqueue_timer(&self, set_name: &str, member: &str, fire_at_unix: i64) {
        let mut set = self
            .timers
            .entry(set_name.to_string())
            .or_insert_with(|| SortedSet { members: Vec::new() });
        set.members.retain(|(m, _)| m != member);
        set.members.push((member.to_string(), fire_at_unix));
    }

    fn drain_due_timers(&self, set_name: &str, now_unix: i64) -> Vec<String> {
        let Some(mut set) = self.timers.get_mut(set_name) else {
            return Vec::new();
        };
        let (due, remaining): (Vec<_>, Vec<_>) =
            set.members.drain(..).partition(|(_, score)| *score <= now_unix);
        set.members = remaining;
        due.into_iter().map(|(m, _)| m).collect()
    }

    fn remove_timer(&self, set_name: &str, member: &str) {
        if let Some(mut set) = self.timers.get_mut(set_name) {
            set.members.retain(|(m, _)| m != member);
        }
    }

    fn acquire_scheduler_lease(&self, ttl: Duration) -> Claim {
        self.try_acquire("scheduler:lock", ttl)
    }

    fn acquire_conv_lease(&self, conversation_key: &str, ttl: Duration) -> Claim {
        self.try_acquire(&format!("context_summary:lock:{conversation_key}"), ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_second_insert_is_rejected() {
        let store = DashMapStore::new();
        assert!(store.increment_dedup("msg-1", Duration::from_secs(300)));
        assert!(!store.increment_dedup("msg-1", Duration::from_secs(300)));
    }

    #[test]
    fn scheduler_lease_is_exclusive_until_expiry() {
        let store = DashMapStore::new();
        assert_eq!(
            store.acquire_scheduler_lease(Duration::from_millis(50)),
            Claim::Acquired
        );
        assert_eq!(
            store.acquire_scheduler_lease(Duration::from_millis(50)),
            Claim::HeldByOther
        );
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(
            store.acquire_scheduler_lease(Duration::from_millis(50)),
            Claim::Acquired
        );
    }

    #[test]
    fn batch_drain_gate_is_per_pair() {
        let store = DashMapStore::new();
        assert_eq!(
            store.claim_batch_drain("a1:+972501", Duration::from_secs(30)),
            Claim::Acquired
        );
        assert_eq!(
            store.claim_batch_drain("a1:+972502", Duration::from_secs(30)),
            Claim::Acquired
        );
        assert_eq!(
            store.claim_batch_drain("a1:+972501", Duration::from_secs(30)),
            Claim::HeldByOther
        );
    }

    #[test]
    fn timer_claim_by_drain_is_exclusive() {
        let store = DashMapStore::new();
        store.enqueue_timer("followup:timers", "1:2", 100);
        let first = store.drain_due_timers("followup:timers", 200);
        assert_eq!(first, vec!["1:2".to_string()]);
        let second = store.drain_due_timers("followup:timers", 200);
        assert!(second.is_empty());
    }

    #[test]
    fn timer_not_yet_due_is_not_drained() {
        let store = DashMapStore::new();
        store.enqueue_timer("followup:timers", "1:2", 1_000_000);
        assert!(store.drain_due_timers("followup:timers", 1).is_empty());
    }

    #[test]
    fn remove_timer_cancels_pending_member() {
        let store = DashMapStore::new();
        store.enqueue_timer("followup:timers", "1:2", 100);
        store.remove_timer("followup:timers", "1:2");
        assert!(store.drain_due_timers("followup:timers", 1000).is_empty());
    }

    #[test]
    fn re_enqueue_replaces_existing_member_score() {
        let store = DashMapStore::new();
        store.enqueue_timer("followup:timers", "1:2", 100);
        store.enqueue_timer("followup:timers", "1:2", 500);
        assert!(store.drain_due_timers("followup:timers", 400).is_empty());
        assert_eq!(
            store.drain_due_timers("followup:timers", 500),
            vec!["1:2".to_string()]
        );
    }
}
