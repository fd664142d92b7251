use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::Plugin;
use crate::platform::{NormalizedEvent, Outbound, Platform};

const GREETING: &str = "Welcome! I relay messages between Telegram and WhatsApp.\n\n\
                        Use /help for the list of commands.";

/// Greets each private-chat sender once per process
pub struct WelcomePlugin {
    outbound: Arc<dyn Outbound>,
    greeted: Mutex<HashSet<(Platform, String)>>,
}

impl WelcomePlugin {
    pub fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self {
            outbound,
            greeted: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl Plugin for WelcomePlugin {
    fn name(&self) -> &str {
        "welcome"
    }

    async fn process_message(&self, event: &mut NormalizedEvent) -> Result<()> {
        if event.is_group() || event.is_relayed() {
            return Ok(());
        }

        let first_contact = self
            .greeted
            .lock()
            .await
            .insert((event.platform(), event.sender_id().to_string()));
        if !first_contact {
            return Ok(());
        }

        info!(
            "Greeting new sender {} on {}",
            event.sender_id(),
            event.platform()
        );
        self.outbound
            .send(event.platform(), event.chat_id(), GREETING, None)
            .await
            .context("Failed to send welcome message")
    }
}
