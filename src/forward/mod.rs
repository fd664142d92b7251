use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::platform::{Media, NormalizedEvent, Outbound, Platform};

/// Cache key the rule snapshot is stored under
pub const RULES_CACHE_KEY: &str = "forward:rules";

const MEDIA_REMOVED_NOTE: &str = "Media rimosso";
const MEDIA_NOT_ALLOWED_NOTE: &str = "[Media non consentiti per questa regola]";

/// Source → destination mapping with a transformation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub from_platform: Platform,
    pub to_platform: Platform,
    /// Source chat id → destination chat ids, in fan-out order
    #[serde(default)]
    pub chat_map: HashMap<String, Vec<String>>,
    #[serde(default = "default_media_allowed")]
    pub media_allowed: bool,
    /// Strip media unconditionally; wins over `media_allowed`
    #[serde(default)]
    pub text_only: bool,
}

fn default_media_allowed() -> bool {
    true
}

impl ForwardRule {
    pub fn new(from_platform: Platform, to_platform: Platform) -> Self {
        Self {
            from_platform,
            to_platform,
            chat_map: HashMap::new(),
            media_allowed: true,
            text_only: false,
        }
    }

    /// Map `source` to `destinations` (appending to any existing list)
    pub fn route(mut self, source: &str, destinations: &[&str]) -> Self {
        self.chat_map
            .entry(source.to_string())
            .or_default()
            .extend(destinations.iter().map(|d| d.to_string()));
        self
    }

    pub fn media_allowed(mut self, allowed: bool) -> Self {
        self.media_allowed = allowed;
        self
    }

    pub fn text_only(mut self, text_only: bool) -> Self {
        self.text_only = text_only;
        self
    }

    /// Destination chats for `event`, or None if the rule does not apply
    pub fn destinations_for(&self, event: &NormalizedEvent) -> Option<&[String]> {
        if self.from_platform != event.platform() {
            return None;
        }
        self.chat_map.get(event.chat_id()).map(Vec::as_slice)
    }

    /// Text and media to deliver for `event` under this rule.
    ///
    /// Media notes are appended first, then the source tag is prepended to
    /// the whole text.
    pub fn transform(&self, event: &NormalizedEvent) -> (String, Option<Media>) {
        let mut text = event.text.clone();
        let media = match &event.media {
            Some(media) if self.text_only => {
                text.push_str(&format!("\n[{}: {}]", MEDIA_REMOVED_NOTE, media.media_type));
                None
            }
            Some(_) if !self.media_allowed => {
                text.push('\n');
                text.push_str(MEDIA_NOT_ALLOWED_NOTE);
                None
            }
            other => other.clone(),
        };

        (format!("{} {}", event.platform().tag(), text), media)
    }
}

/// True when `text` starts with the tag of any known platform
pub fn is_relay_tagged(text: &str) -> bool {
    Platform::ALL.iter().any(|p| text.starts_with(&p.tag()))
}

/// External mirror of the rule sequence. Best-effort: memory is authoritative.
#[async_trait]
pub trait RuleCache: Send + Sync {
    async fn store_rules(&self, snapshot: &str, ttl: Duration) -> Result<()>;
    async fn load_rules(&self) -> Result<Option<String>>;
}

/// Outcome of one `forward_message` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// The live, ordered rule sequence plus the engine that applies it.
///
/// Readers take an immutable `Arc` snapshot; `add_rule` and the cache reload
/// swap in a new one under the write lock, so an event never sees a
/// half-updated sequence.
pub struct ForwardRuleSet {
    rules: Arc<RwLock<Arc<Vec<ForwardRule>>>>,
    cache: Arc<dyn RuleCache>,
    cache_ttl: Duration,
    // Serializes snapshot writes so the newest sequence is always written last
    cache_writer: Arc<Mutex<()>>,
}

impl ForwardRuleSet {
    pub fn new(cache: Arc<dyn RuleCache>, cache_ttl: Duration) -> Self {
        Self {
            rules: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            cache,
            cache_ttl,
            cache_writer: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the rule sequence with the cached snapshot, if one exists.
    /// Returns whether anything was restored.
    pub async fn load_rules_from_cache(&self) -> bool {
        let cached = match self.cache.load_rules().await {
            Ok(Some(json)) => json,
            Ok(None) => {
                info!("No cached forward rules found");
                return false;
            }
            Err(e) => {
                warn!("Failed to read forward rules from cache: {:#}", e);
                return false;
            }
        };

        match serde_json::from_str::<Vec<ForwardRule>>(&cached) {
            Ok(rules) => {
                let count = rules.len();
                *self.rules.write().await = Arc::new(rules);
                info!("Loaded {} forward rules from cache", count);
                true
            }
            Err(e) => {
                warn!("Ignoring unreadable forward rule snapshot: {}", e);
                false
            }
        }
    }

    /// Append a rule and mirror the whole sequence to the cache in the
    /// background. Await the handle to wait for the cache write.
    pub async fn add_rule(&self, rule: ForwardRule) -> JoinHandle<()> {
        info!(
            "Adding forward rule {} -> {} ({} source chats)",
            rule.from_platform,
            rule.to_platform,
            rule.chat_map.len()
        );
        {
            let mut guard = self.rules.write().await;
            Arc::make_mut(&mut guard).push(rule);
        }

        let rules = Arc::clone(&self.rules);
        let cache = Arc::clone(&self.cache);
        let writer = Arc::clone(&self.cache_writer);
        let ttl = self.cache_ttl;
        tokio::spawn(async move {
            let _write = writer.lock().await;
            let snapshot = rules.read().await.clone();
            if let Err(e) = save_snapshot(cache.as_ref(), &snapshot, ttl).await {
                warn!("Failed to cache forward rules: {:#}", e);
            }
        })
    }

    /// Current rule sequence
    pub async fn snapshot(&self) -> Arc<Vec<ForwardRule>> {
        self.rules.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Deliver `event` to every destination of every matching rule.
    ///
    /// Rules are evaluated in registration order; the destinations of one
    /// rule are sent to concurrently. Each send fails on its own. Identical
    /// destinations reached through several rules are sent to once per rule.
    ///
    /// This does not prevent loops: callers must skip events that were
    /// themselves relayed (see `EventOrigin` and `is_relay_tagged`).
    pub async fn forward_message(
        &self,
        event: &NormalizedEvent,
        send: &dyn Outbound,
    ) -> ForwardReport {
        let rules = self.snapshot().await;
        let mut report = ForwardReport::default();

        for rule in rules.iter() {
            let Some(destinations) = rule.destinations_for(event) else {
                continue;
            };

            let (text, media) = rule.transform(event);
            let text = text.as_str();
            let media = media.as_ref();

            let sends = destinations.iter().map(|dest| async move {
                let result = send.send(rule.to_platform, dest, text, media).await;
                (dest, result)
            });

            for (dest, result) in join_all(sends).await {
                report.attempted += 1;
                match result {
                    Ok(()) => {
                        report.delivered += 1;
                        info!(
                            "Forwarded {}({}) -> {}({})",
                            event.platform(),
                            event.chat_id(),
                            rule.to_platform,
                            dest
                        );
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(
                            "Failed to forward to {}:{}: {:#}",
                            rule.to_platform, dest, e
                        );
                    }
                }
            }
        }

        report
    }
}

async fn save_snapshot(cache: &dyn RuleCache, rules: &[ForwardRule], ttl: Duration) -> Result<()> {
    let json = serde_json::to_string(rules).context("Failed to serialize forward rules")?;
    cache.store_rules(&json, ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MediaType;
    use crate::test_support::RecordingOutbound;
    use anyhow::bail;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryRuleCache {
        entry: StdMutex<Option<(String, Duration)>>,
    }

    #[async_trait]
    impl RuleCache for MemoryRuleCache {
        async fn store_rules(&self, snapshot: &str, ttl: Duration) -> Result<()> {
            *self.entry.lock().unwrap() = Some((snapshot.to_string(), ttl));
            Ok(())
        }

        async fn load_rules(&self) -> Result<Option<String>> {
            Ok(self.entry.lock().unwrap().as_ref().map(|(s, _)| s.clone()))
        }
    }

    struct BrokenRuleCache;

    #[async_trait]
    impl RuleCache for BrokenRuleCache {
        async fn store_rules(&self, _snapshot: &str, _ttl: Duration) -> Result<()> {
            bail!("cache offline")
        }

        async fn load_rules(&self) -> Result<Option<String>> {
            bail!("cache offline")
        }
    }

    fn rule_set() -> ForwardRuleSet {
        ForwardRuleSet::new(
            Arc::new(MemoryRuleCache::default()),
            Duration::from_secs(300),
        )
    }

    fn tg_event(chat: &str, text: &str) -> NormalizedEvent {
        NormalizedEvent::new(Platform::Telegram, chat, "sender", true, text)
    }

    fn tg_to_wa() -> ForwardRule {
        ForwardRule::new(Platform::Telegram, Platform::Whatsapp)
    }

    #[tokio::test]
    async fn test_fans_out_to_every_destination() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1", "d2"])).await;
        let out = RecordingOutbound::new();

        let report = rules.forward_message(&tg_event("c1", "hi"), &out).await;

        let sent = out.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(report.delivered, 2);
        for (msg, dest) in sent.iter().zip(["d1", "d2"]) {
            assert_eq!(msg.platform, Platform::Whatsapp);
            assert_eq!(msg.chat_id, dest);
            assert_eq!(msg.text, "[TELEGRAM] hi");
            assert!(msg.media.is_none());
        }
    }

    #[tokio::test]
    async fn test_media_not_allowed_strips_media_with_note() {
        let rules = rule_set();
        rules
            .add_rule(tg_to_wa().route("c1", &["d1"]).media_allowed(false))
            .await;
        let out = RecordingOutbound::new();
        let event = tg_event("c1", "hi").with_media(Media::new(MediaType::Image, "file-1"));

        rules.forward_message(&event, &out).await;

        let sent = out.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].text,
            "[TELEGRAM] hi\n[Media non consentiti per questa regola]"
        );
        assert!(sent[0].media.is_none());
    }

    #[tokio::test]
    async fn test_text_only_notes_removed_media_type() {
        let rules = rule_set();
        rules
            .add_rule(tg_to_wa().route("c1", &["d1"]).text_only(true))
            .await;
        let out = RecordingOutbound::new();
        let event = tg_event("c1", "listen").with_media(Media::new(MediaType::Audio, "file-2"));

        rules.forward_message(&event, &out).await;

        let sent = out.sent();
        assert_eq!(sent[0].text, "[TELEGRAM] listen\n[Media rimosso: audio]");
        assert!(sent[0].media.is_none());
    }

    #[tokio::test]
    async fn test_text_only_without_media_adds_no_note() {
        let rule = tg_to_wa().route("c1", &["d1"]).text_only(true);
        let (text, media) = rule.transform(&tg_event("c1", "plain"));
        assert_eq!(text, "[TELEGRAM] plain");
        assert!(media.is_none());
    }

    #[test]
    fn test_blocked_media_without_media_adds_no_note() {
        let rule = tg_to_wa().route("c1", &["d1"]).media_allowed(false);
        let (text, media) = rule.transform(&tg_event("c1", "plain"));
        assert_eq!(text, "[TELEGRAM] plain");
        assert!(media.is_none());
    }

    #[tokio::test]
    async fn test_allowed_media_passes_through() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1"])).await;
        let out = RecordingOutbound::new();
        let mut media = Media::new(MediaType::Video, "https://cdn.example/v.mp4");
        media.caption = Some("clip".to_string());
        let event = tg_event("c1", "look").with_media(media.clone());

        rules.forward_message(&event, &out).await;

        assert_eq!(out.sent()[0].media, Some(media));
    }

    #[tokio::test]
    async fn test_unmatched_chat_sends_nothing() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1"])).await;
        let out = RecordingOutbound::new();

        let report = rules.forward_message(&tg_event("other", "hi"), &out).await;

        assert!(out.sent().is_empty());
        assert_eq!(report, ForwardReport::default());
    }

    #[tokio::test]
    async fn test_other_platform_sends_nothing() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1"])).await;
        let out = RecordingOutbound::new();
        let event = NormalizedEvent::new(Platform::Whatsapp, "c1", "s", false, "hi");

        rules.forward_message(&event, &out).await;

        assert!(out.sent().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_rules_send_twice() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1"])).await;
        rules.add_rule(tg_to_wa().route("c1", &["d1"])).await;
        let out = RecordingOutbound::new();

        rules.forward_message(&tg_event("c1", "hi"), &out).await;

        let sent = out.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.chat_id == "d1"));
    }

    #[tokio::test]
    async fn test_failed_destination_does_not_block_others() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1", "d2"])).await;
        rules
            .add_rule(ForwardRule::new(Platform::Telegram, Platform::Telegram).route("c1", &["d3"]))
            .await;
        let out = RecordingOutbound::failing_for(&["d1"]);

        let report = rules.forward_message(&tg_event("c1", "hi"), &out).await;

        let chats: Vec<String> = out.sent().into_iter().map(|m| m.chat_id).collect();
        assert_eq!(chats, vec!["d2", "d3"]);
        assert_eq!(
            report,
            ForwardReport {
                attempted: 3,
                delivered: 2,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_cache_round_trip_restores_rules() {
        let cache = Arc::new(MemoryRuleCache::default());
        let rule = tg_to_wa()
            .route("c1", &["d1", "d2"])
            .media_allowed(false);

        let first = ForwardRuleSet::new(cache.clone(), Duration::from_secs(300));
        first.add_rule(rule.clone()).await.await.unwrap();

        let restarted = ForwardRuleSet::new(cache.clone(), Duration::from_secs(300));
        assert!(restarted.load_rules_from_cache().await);
        assert_eq!(restarted.snapshot().await.as_slice(), &[rule]);

        let ttl = cache.entry.lock().unwrap().as_ref().map(|(_, ttl)| *ttl);
        assert_eq!(ttl, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_cache_holds_latest_sequence_after_rapid_adds() {
        let cache = Arc::new(MemoryRuleCache::default());
        let rules = ForwardRuleSet::new(cache.clone(), Duration::from_secs(60));
        let first = rules.add_rule(tg_to_wa().route("a", &["x"])).await;
        let second = rules.add_rule(tg_to_wa().route("b", &["y"])).await;
        first.await.unwrap();
        second.await.unwrap();

        let restarted = ForwardRuleSet::new(cache, Duration::from_secs(60));
        restarted.load_rules_from_cache().await;
        assert_eq!(restarted.len().await, 2);
    }

    #[tokio::test]
    async fn test_empty_cache_leaves_rules_empty() {
        let rules = rule_set();
        assert!(!rules.load_rules_from_cache().await);
        assert_eq!(rules.len().await, 0);
    }

    #[tokio::test]
    async fn test_broken_cache_is_not_fatal() {
        let rules = ForwardRuleSet::new(Arc::new(BrokenRuleCache), Duration::from_secs(300));
        assert!(!rules.load_rules_from_cache().await);

        rules
            .add_rule(tg_to_wa().route("c1", &["d1"]))
            .await
            .await
            .unwrap();
        let out = RecordingOutbound::new();
        rules.forward_message(&tg_event("c1", "hi"), &out).await;
        assert_eq!(out.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_unaffected_by_later_adds() {
        let rules = rule_set();
        rules.add_rule(tg_to_wa().route("c1", &["d1"])).await;
        let before = rules.snapshot().await;
        rules.add_rule(tg_to_wa().route("c2", &["d2"])).await;

        assert_eq!(before.len(), 1);
        assert_eq!(rules.len().await, 2);
    }

    #[test]
    fn test_rule_defaults_when_deserialized() {
        let rule: ForwardRule = serde_json::from_str(
            r#"{"from_platform":"whatsapp","to_platform":"telegram","chat_map":{"g@g.us":["1"]}}"#,
        )
        .unwrap();
        assert!(rule.media_allowed);
        assert!(!rule.text_only);
        assert_eq!(rule.chat_map["g@g.us"], vec!["1"]);
    }

    #[test]
    fn test_relay_tag_detection() {
        assert!(is_relay_tagged("[TELEGRAM] hi"));
        assert!(is_relay_tagged("[WHATSAPP] hi"));
        assert!(!is_relay_tagged("hi [TELEGRAM]"));
        assert!(!is_relay_tagged("[telegram] hi"));
    }
}
