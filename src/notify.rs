use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::platform::{Outbound, Platform};

/// Where unhandled per-event failures are reported
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Used when no admin chat is configured
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        warn!("[ADMIN] {}", message);
        Ok(())
    }
}

/// Sends notifications to an admin chat through the outbound transports
pub struct OutboundNotifier {
    outbound: Arc<dyn Outbound>,
    platform: Platform,
    chat_id: String,
}

impl OutboundNotifier {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        platform: Platform,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            outbound,
            platform,
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl AdminNotifier for OutboundNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        self.outbound
            .send(self.platform, &self.chat_id, message, None)
            .await
            .with_context(|| {
                format!(
                    "Failed to notify admin at {}:{}",
                    self.platform, self.chat_id
                )
            })
    }
}

pub fn failure_message(platform: Platform, chat_id: &str, error: &str) -> String {
    format!(
        "[ERROR] Processing failed for {}:{}\n{}",
        platform, chat_id, error
    )
}
