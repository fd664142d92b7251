use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::forward::ForwardRule;
use crate::platform::Platform;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default = "default_forwarding_config")]
    pub forwarding: ForwardingConfig,
    #[serde(default = "default_media_logging_config")]
    pub media_logging: MediaLoggingConfig,
    #[serde(default)]
    pub forward_rules: Vec<ForwardRule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Chats the bot listens to; empty accepts every chat
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
}

/// Chat that receives notifications about failed events
#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    pub platform: Platform,
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwardingConfig {
    /// How long the cached rule snapshot outlives its last write
    #[serde(default = "default_rule_cache_ttl_secs")]
    pub rule_cache_ttl_secs: u64,
    /// Also treat text starting with a platform tag as already relayed
    #[serde(default = "default_legacy_prefix_detection")]
    pub legacy_prefix_detection: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaLoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_media_log_max_entries")]
    pub max_entries: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("relaybot.db")
}

fn default_session_retention_days() -> u32 {
    30
}

fn default_rule_cache_ttl_secs() -> u64 {
    300
}

fn default_legacy_prefix_detection() -> bool {
    true
}

fn default_media_log_max_entries() -> usize {
    1000
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
        session_retention_days: default_session_retention_days(),
    }
}

fn default_forwarding_config() -> ForwardingConfig {
    ForwardingConfig {
        rule_cache_ttl_secs: default_rule_cache_ttl_secs(),
        legacy_prefix_detection: default_legacy_prefix_detection(),
    }
}

fn default_media_logging_config() -> MediaLoggingConfig {
    MediaLoggingConfig {
        enabled: false,
        max_entries: default_media_log_max_entries(),
    }
}

impl ForwardingConfig {
    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rule_cache_ttl_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;

        if config.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token must not be empty");
        }
        for (i, rule) in config.forward_rules.iter().enumerate() {
            if rule.chat_map.is_empty() {
                anyhow::bail!("forward_rules[{}] has an empty chat_map", i);
            }
        }

        Ok(config)
    }
}
