use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Storage;
use crate::platform::{MediaType, NormalizedEvent, Platform};

/// One media attachment seen by the relay
#[derive(Debug, Clone, PartialEq)]
pub struct MediaLogEntry {
    pub id: String,
    pub logged_at: DateTime<Utc>,
    pub platform: Platform,
    pub chat_id: String,
    pub sender_id: String,
    pub media_type: MediaType,
    pub media_url: String,
    pub caption: Option<String>,
}

impl MediaLogEntry {
    /// Entry for the event's attachment, or None if it has none
    pub fn from_event(event: &NormalizedEvent) -> Option<Self> {
        let media = event.media.as_ref()?;
        Some(Self {
            id: Uuid::new_v4().to_string(),
            logged_at: Utc::now(),
            platform: event.platform(),
            chat_id: event.chat_id().to_string(),
            sender_id: event.sender_id().to_string(),
            media_type: media.media_type,
            media_url: media.url.clone(),
            caption: media.caption.clone(),
        })
    }
}

impl Storage {
    /// Append an entry, keeping only the newest `max_entries`
    pub async fn log_media(&self, entry: &MediaLogEntry, max_entries: usize) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO media_log
             (id, logged_at, platform, chat_id, sender_id, media_type, media_url, caption)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                &entry.id,
                entry.logged_at.timestamp_millis(),
                entry.platform.as_str(),
                &entry.chat_id,
                &entry.sender_id,
                entry.media_type.as_str(),
                &entry.media_url,
                &entry.caption,
            ],
        )
        .context("Failed to insert media log entry")?;

        conn.execute(
            "DELETE FROM media_log WHERE rowid NOT IN (
                SELECT rowid FROM media_log ORDER BY logged_at DESC, rowid DESC LIMIT ?1
            )",
            rusqlite::params![max_entries as i64],
        )
        .context("Failed to trim media log")?;

        Ok(())
    }

    /// Newest entries first
    #[allow(dead_code)]
    pub async fn recent_media(&self, limit: usize) -> Result<Vec<MediaLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, logged_at, platform, chat_id, sender_id, media_type, media_url, caption
             FROM media_log
             ORDER BY logged_at DESC, rowid DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load media log")?;

        rows.into_iter()
            .map(
                |(id, logged_at, platform, chat_id, sender_id, media_type, media_url, caption)|
                 -> Result<MediaLogEntry> {
                    Ok(MediaLogEntry {
                        id,
                        logged_at: DateTime::from_timestamp_millis(logged_at).unwrap_or_default(),
                        platform: platform.parse()?,
                        chat_id,
                        sender_id,
                        media_type: media_type.parse()?,
                        media_url,
                        caption,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Media;

    fn event_with(url: &str) -> NormalizedEvent {
        let mut media = Media::new(MediaType::Image, url);
        media.caption = Some("caption".to_string());
        NormalizedEvent::new(Platform::Telegram, "c1", "u1", true, "").with_media(media)
    }

    #[test]
    fn test_entry_requires_media() {
        let plain = NormalizedEvent::new(Platform::Telegram, "c1", "u1", true, "text");
        assert!(MediaLogEntry::from_event(&plain).is_none());
        let entry = MediaLogEntry::from_event(&event_with("file-1")).unwrap();
        assert_eq!(entry.media_url, "file-1");
        assert_eq!(entry.caption.as_deref(), Some("caption"));
    }

    #[tokio::test]
    async fn test_log_is_trimmed_to_newest_entries() {
        let store = Storage::open_in_memory().unwrap();
        for i in 0..5 {
            let entry = MediaLogEntry::from_event(&event_with(&format!("file-{}", i))).unwrap();
            store.log_media(&entry, 3).await.unwrap();
        }

        let recent = store.recent_media(10).await.unwrap();
        let urls: Vec<&str> = recent.iter().map(|e| e.media_url.as_str()).collect();
        assert_eq!(urls, vec!["file-4", "file-3", "file-2"]);
        assert_eq!(recent[0].media_type, MediaType::Image);
        assert_eq!(recent[0].platform, Platform::Telegram);
    }
}
