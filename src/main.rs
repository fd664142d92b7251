mod config;
mod forward;
mod notify;
mod platform;
mod plugins;
mod router;
mod scheduler;
mod storage;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::{prelude::Requester, Bot};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::forward::ForwardRuleSet;
use crate::notify::{AdminNotifier, LogNotifier, OutboundNotifier};
use crate::platform::telegram::TelegramTransport;
use crate::platform::{Outbound, Outbox, Platform};
use crate::plugins::{
    AutoForwardPlugin, CommandPlugin, MediaLoggerPlugin, PluginPipeline, WelcomePlugin,
};
use crate::router::Router;
use crate::scheduler::Scheduler;
use crate::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Database: {}", config.storage.database_path.display());
    info!("  Allowed chats: {:?}", config.telegram.allowed_chat_ids);
    info!("  Configured forward rules: {}", config.forward_rules.len());

    let storage = Storage::open(&config.storage.database_path)?;
    let outbox = Arc::new(Outbox::new());
    let outbound: Arc<dyn Outbound> = outbox.clone();

    // Restore rules from the cache; fall back to the configured ones
    let rules = Arc::new(ForwardRuleSet::new(
        Arc::new(storage.clone()),
        config.forwarding.rule_cache_ttl(),
    ));
    if !rules.load_rules_from_cache().await {
        for rule in config.forward_rules.iter().cloned() {
            rules.add_rule(rule).await;
        }
    }

    let notifier: Arc<dyn AdminNotifier> = match &config.admin {
        Some(admin) => Arc::new(OutboundNotifier::new(
            Arc::clone(&outbound),
            admin.platform,
            admin.chat_id.clone(),
        )),
        None => Arc::new(LogNotifier),
    };

    let bot = Bot::new(&config.telegram.bot_token);
    let me = bot
        .get_me()
        .await
        .context("Failed to fetch bot info; check telegram.bot_token")?;
    info!("Running as @{}", me.username.as_deref().unwrap_or("<unknown>"));

    // Registration order is the processing order
    let mut pipeline = PluginPipeline::new();
    pipeline.register(Arc::new(WelcomePlugin::new(Arc::clone(&outbound))));
    pipeline.register(Arc::new(CommandPlugin::new(
        Arc::clone(&outbound),
        Arc::clone(&rules),
        me.username.clone(),
    )));
    if config.media_logging.enabled {
        pipeline.register(Arc::new(MediaLoggerPlugin::new(
            storage.clone(),
            config.media_logging.max_entries,
        )));
    }
    pipeline.register(Arc::new(AutoForwardPlugin::new(
        Arc::clone(&rules),
        Arc::clone(&outbound),
        config.forwarding.legacy_prefix_detection,
    )));

    info!("Active plugins: {}", pipeline.names().join(", "));
    info!("Active forward rules: {}", rules.len().await);

    let router = Arc::new(Router::new(
        Arc::new(pipeline),
        Arc::new(storage.clone()),
        notifier,
    ));

    outbox
        .attach(Arc::new(TelegramTransport::new(bot.clone())))
        .await;

    // Sends to platforms without a transport fail per destination; say so once
    for platform in Platform::ALL {
        if !outbox.is_attached(platform).await {
            warn!("No outbound transport for {}; sends to it will fail", platform);
        }
    }

    let scheduler = Scheduler::new().await?;
    scheduler::tasks::register_maintenance_tasks(
        &scheduler,
        storage,
        config.storage.session_retention_days,
    )
    .await?;
    scheduler.start().await?;

    info!("Relay is starting...");
    platform::telegram::run(router, bot, config.telegram.allowed_chat_ids.clone()).await?;

    Ok(())
}
