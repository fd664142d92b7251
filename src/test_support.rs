//! Recording fakes shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::platform::{Media, Outbound, Platform};

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub platform: Platform,
    pub chat_id: String,
    pub text: String,
    pub media: Option<Media>,
}

/// Records every send; chats listed in `failing` return an error instead
#[derive(Default)]
pub struct RecordingOutbound {
    pub sent: Mutex<Vec<SentMessage>>,
    failing: HashSet<String>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(chats: &[&str]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: chats.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send(
        &self,
        platform: Platform,
        chat_id: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<()> {
        if self.failing.contains(chat_id) {
            bail!("send to {} refused", chat_id);
        }
        self.sent.lock().unwrap().push(SentMessage {
            platform,
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            media: media.cloned(),
        });
        Ok(())
    }
}
