//! Layered configuration: `wa.toml` + `WA_`-prefixed environment overrides.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (`wa.toml` + `WA_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub llm: LlmKeysConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

impl Default for WaConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            llm: LlmKeysConfig::default(),
            webhooks: WebhooksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Cadence and batch sizes for the distributed scheduler (C7-C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_scheduler_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_reminder_batch_size")]
    pub reminder_batch_size: usize,
    #[serde(default = "default_followup_batch_size")]
    pub followup_batch_size: usize,
    #[serde(default = "default_followup_concurrency")]
    pub followup_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            lease_secs: default_scheduler_lease_secs(),
            reminder_batch_size: default_reminder_batch_size(),
            followup_batch_size: default_followup_batch_size(),
            followup_concurrency: default_followup_concurrency(),
        }
    }
}

/// Multi-key pools for each LLM provider class, loaded from comma-separated
/// env vars with a fallback to a single key. Mirrors the original key-manager
/// environment contract (`ANTHROPIC_API_KEYS` / `ANTHROPIC_API_KEY`, etc.).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmKeysConfig {
    #[serde(default)]
    pub anthropic_api_keys: String,
    #[serde(default)]
    pub anthropic_api_key: String,
    #[serde(default)]
    pub openai_api_keys: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default)]
    pub google_api_keys: String,
    #[serde(default)]
    pub google_api_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhooksConfig {
    /// When false, `/webhook` and `/webhook/wasender/:agent_id` return 404.
    #[serde(default)]
    pub enabled: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.wa-agent/wa.db", home)
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_scheduler_lease_secs() -> u64 {
    180
}
fn default_reminder_batch_size() -> usize {
    50
}
fn default_followup_batch_size() -> usize {
    50
}
fn default_followup_concurrency() -> usize {
    10
}

impl WaConfig {
    /// Load config from a TOML file with `WA_*` env var overrides.
    ///
    /// Checks in order: explicit path argument, then `WA_CONFIG` env var,
    /// then `~/.wa-agent/wa.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("WA_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: WaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WA_").split("_"))
            .extract()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.wa-agent/wa.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = WaConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.scheduler.check_interval_secs, 30);
        assert_eq!(cfg.scheduler.followup_concurrency, 10);
    }
}
