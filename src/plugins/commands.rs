use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::Plugin;
use crate::forward::ForwardRuleSet;
use crate::platform::{NormalizedEvent, Outbound};

/// Answers slash commands and consumes them.
///
/// After replying, the event text is cleared so later plugins (forwarding in
/// particular) treat the command as handled.
pub struct CommandPlugin {
    outbound: Arc<dyn Outbound>,
    rules: Arc<ForwardRuleSet>,
    /// Username commands may be addressed to as `/cmd@name`
    bot_username: Option<String>,
    started_at: DateTime<Utc>,
}

impl CommandPlugin {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        rules: Arc<ForwardRuleSet>,
        bot_username: Option<String>,
    ) -> Self {
        Self {
            outbound,
            rules,
            bot_username,
            started_at: Utc::now(),
        }
    }

    async fn reply_for(&self, command: &str) -> String {
        match command {
            "/help" | "/start" => "Available commands:\n\
                 /help - Show this message\n\
                 /status - Show relay status\n\
                 /rules - List forwarding rules"
                .to_string(),
            "/status" => {
                let uptime = Utc::now() - self.started_at;
                format!(
                    "Relay status:\n- Forward rules: {}\n- Uptime: {}h {}m",
                    self.rules.len().await,
                    uptime.num_hours(),
                    uptime.num_minutes() % 60
                )
            }
            "/rules" => self.describe_rules().await,
            _ => "Unknown command. Use /help for the list of commands.".to_string(),
        }
    }

    async fn describe_rules(&self) -> String {
        let rules = self.rules.snapshot().await;
        if rules.is_empty() {
            return "No forwarding rules configured.".to_string();
        }

        let mut out = String::from("Forwarding rules:\n");
        for (i, rule) in rules.iter().enumerate() {
            let policy = if rule.text_only {
                "text only"
            } else if rule.media_allowed {
                "media allowed"
            } else {
                "media blocked"
            };
            out.push_str(&format!(
                "\n{}. {} -> {} ({})\n",
                i + 1,
                rule.from_platform,
                rule.to_platform,
                policy
            ));
            let mut sources: Vec<_> = rule.chat_map.iter().collect();
            sources.sort();
            for (source, destinations) in sources {
                out.push_str(&format!("   {} => {}\n", source, destinations.join(", ")));
            }
        }
        out
    }
}

/// `/Help@RelayBot args` → `/help`.
///
/// Commands addressed to another bot (`/help@OtherBot`) are not ours and
/// yield None, as does any `@` suffix when our username is unknown.
fn parse_command(text: &str, bot_username: Option<&str>) -> Option<String> {
    let word = text.split_whitespace().next()?;
    if !word.starts_with('/') || word.len() < 2 {
        return None;
    }
    let (command, target) = match word.split_once('@') {
        Some((command, target)) => (command, Some(target)),
        None => (word, None),
    };
    if let Some(target) = target {
        let ours = bot_username.is_some_and(|name| name.eq_ignore_ascii_case(target));
        if !ours {
            return None;
        }
    }
    Some(command.to_lowercase())
}

#[async_trait]
impl Plugin for CommandPlugin {
    fn name(&self) -> &str {
        "commands"
    }

    async fn process_message(&self, event: &mut NormalizedEvent) -> Result<()> {
        if event.is_relayed() {
            return Ok(());
        }
        let Some(command) = parse_command(&event.text, self.bot_username.as_deref()) else {
            return Ok(());
        };

        info!(
            "Command {} from {}({})",
            command,
            event.platform(),
            event.chat_id()
        );
        let reply = self.reply_for(&command).await;
        event.text.clear();

        self.outbound
            .send(event.platform(), event.chat_id(), &reply, None)
            .await
            .with_context(|| format!("Failed to reply to {}", command))
    }
}
