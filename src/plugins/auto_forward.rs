use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::Plugin;
use crate::forward::{is_relay_tagged, ForwardRuleSet};
use crate::platform::{NormalizedEvent, Outbound};

/// Drives the forwarding engine for every event that is safe to relay.
///
/// Loop prevention lives here, not in the engine: events marked as relayed
/// by their adapter are never forwarded, and with `legacy_prefix_detection`
/// neither is text that already carries a platform tag.
pub struct AutoForwardPlugin {
    rules: Arc<ForwardRuleSet>,
    outbound: Arc<dyn Outbound>,
    legacy_prefix_detection: bool,
}

impl AutoForwardPlugin {
    pub fn new(
        rules: Arc<ForwardRuleSet>,
        outbound: Arc<dyn Outbound>,
        legacy_prefix_detection: bool,
    ) -> Self {
        Self {
            rules,
            outbound,
            legacy_prefix_detection,
        }
    }

    fn skip_reason(&self, event: &NormalizedEvent) -> Option<&'static str> {
        if event.is_relayed() {
            return Some("relayed event");
        }
        if self.legacy_prefix_detection && is_relay_tagged(&event.text) {
            return Some("already tagged");
        }
        if event.text.starts_with("/start") || event.text.starts_with("/help") {
            return Some("system command");
        }
        if event.text.is_empty() && event.media.is_none() {
            return Some("nothing to forward");
        }
        None
    }
}

#[async_trait]
impl Plugin for AutoForwardPlugin {
    fn name(&self) -> &str {
        "auto-forward"
    }

    async fn process_message(&self, event: &mut NormalizedEvent) -> Result<()> {
        if let Some(reason) = self.skip_reason(event) {
            debug!(
                "Not forwarding {}({}): {}",
                event.platform(),
                event.chat_id(),
                reason
            );
            return Ok(());
        }

        let report = self
            .rules
            .forward_message(event, self.outbound.as_ref())
            .await;
        if report.attempted > 0 {
            debug!(
                "Forwarded {}({}) to {}/{} destinations",
                event.platform(),
                event.chat_id(),
                report.delivered,
                report.attempted
            );
        }
        Ok(())
    }
}
