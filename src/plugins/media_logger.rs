use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::Plugin;
use crate::platform::NormalizedEvent;
use crate::storage::media_log::MediaLogEntry;
use crate::storage::Storage;

/// Records every attachment in the storage media log
pub struct MediaLoggerPlugin {
    storage: Storage,
    max_entries: usize,
}

impl MediaLoggerPlugin {
    pub fn new(storage: Storage, max_entries: usize) -> Self {
        Self {
            storage,
            max_entries,
        }
    }
}

#[async_trait]
impl Plugin for MediaLoggerPlugin {
    fn name(&self) -> &str {
        "media-logger"
    }

    async fn process_message(&self, event: &mut NormalizedEvent) -> Result<()> {
        let Some(entry) = MediaLogEntry::from_event(event) else {
            return Ok(());
        };

        self.storage.log_media(&entry, self.max_entries).await?;
        debug!(
            "Logged {} from {} on {}",
            entry.media_type, entry.sender_id, entry.platform
        );
        Ok(())
    }
}
