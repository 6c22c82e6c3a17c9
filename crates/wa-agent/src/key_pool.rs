//! Per-provider-class API key pool: round-robin selection with cooldown on
//! rate limiting and permanent removal on auth failure.
//!
//! Mirrors the original deployment's key manager: `available_at`/`dead` state
//! per key, a rotating counter so load spreads across the pool instead of
//! always hammering key 0, and a "soonest available" fallback when every
//! pool key is cooling down. Agent-level key overrides are handled by the
//! caller (the provider adapter checks `agent.custom_api_keys` first) — this
//! pool only ever manages the shared system pool.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{AgentError, Result};

const COOLDOWN_DEFAULT: Duration = Duration::from_secs(30);
const JITTER_MAX_SECS: f64 = 10.0;

struct KeyState {
    key: String,
    available_at: Instant,
    dead: bool,
}

pub struct KeyPool {
    keys: Mutex<Vec<KeyState>>,
    counter: Mutex<usize>,
}

impl KeyPool {
    /// Parses a comma-separated multi-key env value, falling back to a
    /// single key when the multi-value is empty — same contract as
    /// `ANTHROPIC_API_KEYS` / `ANTHROPIC_API_KEY`.
    pub fn from_env_values(multi: &str, single: &str) -> Self {
        let mut keys: Vec<String> = multi
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if keys.is_empty() && !single.trim().is_empty() {
            keys.push(single.trim().to_string());
        }
        let now = Instant::now();
        Self {
            keys: Mutex::new(
                keys.into_iter()
                    .map(|key| KeyState { key, available_at: now, dead: false })
                    .collect(),
            ),
            counter: Mutex::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().unwrap().is_empty()
    }

    /// Next available key, round-robin from the rotating counter. Falls back
    /// to the key with the soonest `available_at` if every key is cooling
    /// down, and only fails when the pool is empty or every key is dead.
    pub fn next(&self) -> Result<String> {
        let keys = self.keys.lock().unwrap();
        let n = keys.len();
        if n == 0 {
            return Err(AgentError::KeyPoolExhausted);
        }
        let mut counter = self.counter.lock().unwrap();
        let start = *counter % n;
        let now = Instant::now();
        for i in 0..n {
            let idx = (start + i) % n;
            if !keys[idx].dead && now >= keys[idx].available_at {
                *counter = idx + 1;
                return Ok(keys[idx].key.clone());
            }
        }
        keys.iter()
            .filter(|k| !k.dead)
            .min_by_key(|k| k.available_at)
            .map(|k| k.key.clone())
            .ok_or(AgentError::KeyPoolExhausted)
    }

    /// Puts `key` on cooldown after a 429. `retry_after` is the provider's
    /// `Retry-After` hint if present; a small random jitter is added so
    /// multiple instances don't all retry in lockstep.
    pub fn mark_rate_limited(&self, key: &str, retry_after: Option<Duration>) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(ks) = keys.iter_mut().find(|k| k.key == key) {
            let jitter = Duration::from_secs_f64(rand::random::<f64>() * JITTER_MAX_SECS);
            ks.available_at = Instant::now() + retry_after.unwrap_or(COOLDOWN_DEFAULT) + jitter;
        }
    }

    /// Permanently disables `key` after an auth failure. There is no
    /// un-dead — a fresh process restart reloads the pool from config.
    pub fn mark_dead(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(ks) = keys.iter_mut().find(|k| k.key == key) {
            ks.dead = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robins_across_keys() {
        let pool = KeyPool::from_env_values("a,b,c", "");
        let first = pool.next().unwrap();
        let second = pool.next().unwrap();
        let third = pool.next().unwrap();
        let fourth = pool.next().unwrap();
        assert_eq!(vec![first, second, third, fourth], vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn falls_back_to_singular_key_when_multi_empty() {
        let pool = KeyPool::from_env_values("", "solo-key");
        assert_eq!(pool.next().unwrap(), "solo-key");
    }

    #[test]
    fn rate_limited_key_is_skipped_until_cooldown_expires() {
        let pool = KeyPool::from_env_values("a,b", "");
        pool.mark_rate_limited("a", Some(Duration::from_secs(3600)));
        assert_eq!(pool.next().unwrap(), "b");
        assert_eq!(pool.next().unwrap(), "b");
    }

    #[test]
    fn dead_key_is_never_selected() {
        let pool = KeyPool::from_env_values("a,b", "");
        pool.mark_dead("a");
        for _ in 0..5 {
            assert_eq!(pool.next().unwrap(), "b");
        }
    }

    #[test]
    fn empty_pool_errors() {
        let pool = KeyPool::from_env_values("", "");
        assert!(matches!(pool.next(), Err(AgentError::KeyPoolExhausted)));
    }
}
