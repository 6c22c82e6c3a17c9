use chrono::{Duration, Utc};
use rusqlite::params;

use crate::error::{is_unique_violation, Result};
use crate::store::Store;

impl Store {
    /// Durable counterpart to `SharedStore::increment_dedup`: a provider
    /// webhook id that survives a process restart. Returns `true` if this
    /// call recorded the key (first time seen), `false` if a row already
    /// existed — the same race the in-memory dedup cache guards against,
    /// just backed by the UNIQUE constraint instead of a `DashMap` entry.
    pub fn record_processed_message(&self, dedup_key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        match conn.execute(
            "INSERT INTO processed_messages (dedup_key, created_at) VALUES (?1, ?2)",
            params![dedup_key, Utc::now().to_rfc3339()],
        ) {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops ledger rows older than `older_than`. Called opportunistically
    /// by the scheduler tick rather than on a dedicated timer.
    pub fn prune_processed_messages(&self, older_than: Duration) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM processed_messages WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_record_of_same_key_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_processed_message("wamid.ABC123").unwrap());
        assert!(!store.record_processed_message("wamid.ABC123").unwrap());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_processed_message("a").unwrap());
        assert!(store.record_processed_message("b").unwrap());
    }
}
