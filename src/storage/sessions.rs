use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use serde_json::{Map, Value};

use super::Storage;
use crate::platform::Platform;

/// Last known state of one chat
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub platform: Platform,
    pub chat_id: String,
    pub last_message: Option<String>,
    pub last_media_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(platform: Platform, chat_id: impl Into<String>) -> Self {
        Self {
            platform,
            chat_id: chat_id.into(),
            last_message: None,
            last_media_id: None,
            metadata: Map::new(),
            last_active: Utc::now(),
        }
    }

    fn key(platform: Platform, chat_id: &str) -> String {
        format!("{}:{}", platform, chat_id)
    }
}

/// Best-effort persistence of per-chat session state
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert the session; metadata is merged into what is already stored
    async fn save_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, platform: Platform, chat_id: &str) -> Result<Option<Session>>;
}

#[async_trait]
impl SessionStore for Storage {
    async fn save_session(&self, session: &Session) -> Result<()> {
        let id = Session::key(session.platform, &session.chat_id);
        let conn = self.conn.lock().await;

        let existing: Option<String> = conn
            .query_row(
                "SELECT meta FROM sessions WHERE id = ?1",
                rusqlite::params![&id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read session metadata")?;

        let mut meta: Map<String, Value> = existing
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        meta.extend(session.metadata.clone());
        let meta_json = serde_json::to_string(&meta)?;

        conn.execute(
            "INSERT INTO sessions
             (id, platform, chat_id, last_message, last_media_id, meta, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                last_message = excluded.last_message,
                last_media_id = excluded.last_media_id,
                meta = excluded.meta,
                last_active = excluded.last_active",
            rusqlite::params![
                &id,
                session.platform.as_str(),
                &session.chat_id,
                &session.last_message,
                &session.last_media_id,
                &meta_json,
                session.last_active.timestamp(),
            ],
        )
        .with_context(|| format!("Failed to save session {}", id))?;

        Ok(())
    }

    async fn get_session(&self, platform: Platform, chat_id: &str) -> Result<Option<Session>> {
        let id = Session::key(platform, chat_id);
        let conn = self.conn.lock().await;

        let row = conn
            .query_row(
                "SELECT last_message, last_media_id, meta, last_active
                 FROM sessions WHERE id = ?1",
                rusqlite::params![&id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("Failed to load session {}", id))?;

        let Some((last_message, last_media_id, meta, last_active)) = row else {
            return Ok(None);
        };

        Ok(Some(Session {
            platform,
            chat_id: chat_id.to_string(),
            last_message,
            last_media_id,
            metadata: serde_json::from_str(&meta).context("Corrupt session metadata")?,
            last_active: DateTime::from_timestamp(last_active, 0).unwrap_or_default(),
        }))
    }
}

impl Storage {
    /// Delete sessions inactive for more than `days` days
    pub async fn cleanup_old_sessions(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM sessions WHERE last_active < ?1",
                rusqlite::params![cutoff.timestamp()],
            )
            .context("Failed to clean up old sessions")?;
        Ok(removed)
    }

    pub async fn session_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT count(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
