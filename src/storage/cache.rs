use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;

use super::Storage;
use crate::forward::{RuleCache, RULES_CACHE_KEY};

impl Storage {
    /// Store `value` under `key`; `ttl = None` keeps it until overwritten
    pub async fn cache_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at],
        )
        .with_context(|| format!("Failed to write cache key {}", key))?;
        Ok(())
    }

    /// Value under `key`, or None if missing or expired
    pub async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM cache
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            rusqlite::params![key, now],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read cache key {}", key))
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired_cache(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM cache WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                rusqlite::params![now],
            )
            .context("Failed to purge expired cache entries")?;
        Ok(removed)
    }
}

#[async_trait]
impl RuleCache for Storage {
    async fn store_rules(&self, snapshot: &str, ttl: Duration) -> Result<()> {
        self.cache_set(RULES_CACHE_KEY, snapshot, Some(ttl)).await
    }

    async fn load_rules(&self) -> Result<Option<String>> {
        self.cache_get(RULES_CACHE_KEY).await
    }
}
