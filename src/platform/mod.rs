pub mod telegram;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// Chat transports the relay can receive from and send to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Whatsapp,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Telegram, Platform::Whatsapp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Whatsapp => "whatsapp",
        }
    }

    /// Bracketed uppercase tag put in front of relayed text, e.g. `[TELEGRAM]`
    pub fn tag(&self) -> String {
        format!("[{}]", self.as_str().to_uppercase())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "telegram" => Ok(Platform::Telegram),
            "whatsapp" => Ok(Platform::Whatsapp),
            other => bail!("Unknown platform: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Document,
    Audio,
    Video,
    Sticker,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Document => "document",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Sticker => "sticker",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(MediaType::Image),
            "document" => Ok(MediaType::Document),
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            "sticker" => Ok(MediaType::Sticker),
            other => bail!("Unknown media type: {}", other),
        }
    }
}

/// An attachment carried by an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    /// Transport-scoped reference: an http(s) URL or a platform file id
    pub url: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Media {
    pub fn new(media_type: MediaType, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_type,
            caption: None,
            mime_type: None,
            size: None,
        }
    }
}

/// Where an event came from, as far as the adapter can tell.
///
/// `Relayed` events were produced by a relay (this one or another bot) and
/// must never be forwarded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrigin {
    #[default]
    Native,
    Relayed,
}

/// A message received from any platform, in platform-agnostic form.
///
/// Only `text` and `media` are writable; the pipeline hands one `&mut` to
/// each plugin in turn, so there is never more than one writer at a time.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    platform: Platform,
    chat_id: String,
    sender_id: String,
    is_group: bool,
    timestamp: DateTime<Utc>,
    origin: EventOrigin,
    /// The message text (possibly empty)
    pub text: String,
    /// The attachment, if the inbound message had one
    pub media: Option<Media>,
}

impl NormalizedEvent {
    pub fn new(
        platform: Platform,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        is_group: bool,
        text: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            is_group,
            timestamp: Utc::now(),
            origin: EventOrigin::Native,
            text: text.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = Some(media);
        self
    }

    /// Mark the event as produced by a relay
    pub fn relayed(mut self) -> Self {
        self.origin = EventOrigin::Relayed;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn origin(&self) -> EventOrigin {
        self.origin
    }

    pub fn is_relayed(&self) -> bool {
        self.origin() == EventOrigin::Relayed
    }
}

/// Transport-agnostic send capability used by forwarding and reply plugins
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(
        &self,
        platform: Platform,
        chat_id: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<()>;
}

/// Outbound side of a single platform adapter
#[async_trait]
pub trait Transport: Send + Sync {
    fn platform(&self) -> Platform;

    async fn send(&self, chat_id: &str, text: &str, media: Option<&Media>) -> Result<()>;
}

/// Routes outbound messages to whichever transport serves the platform.
///
/// Transports are attached after construction because adapters need the
/// router (and therefore the plugins holding this outbox) to start.
#[derive(Default)]
pub struct Outbox {
    transports: RwLock<HashMap<Platform, Arc<dyn Transport>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, transport: Arc<dyn Transport>) {
        let platform = transport.platform();
        self.transports.write().await.insert(platform, transport);
        info!("Attached outbound transport for {}", platform);
    }

    pub async fn is_attached(&self, platform: Platform) -> bool {
        self.transports.read().await.contains_key(&platform)
    }
}

#[async_trait]
impl Outbound for Outbox {
    async fn send(
        &self,
        platform: Platform,
        chat_id: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<()> {
        // Clone the handle so the lock is not held across the network call
        let transport = self.transports.read().await.get(&platform).cloned();
        match transport {
            Some(transport) => transport.send(chat_id, text, media).await,
            None => bail!("No transport attached for {}", platform),
        }
    }
}
