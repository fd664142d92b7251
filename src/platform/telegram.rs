use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, FileMeta, InputFile};
use tracing::{info, warn};

use crate::platform::{Media, MediaType, NormalizedEvent, Platform, Transport};
use crate::router::Router;

/// Telegram rejects messages over 4096 chars; leave some headroom
const MAX_MESSAGE_LEN: usize = 4000;
const MAX_CAPTION_LEN: usize = 1024;

/// Split long messages for Telegram's length limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Run the Telegram inbound side until the dispatcher stops
pub async fn run(router: Arc<Router>, bot: Bot, allowed_chat_ids: Vec<i64>) -> Result<()> {
    info!("Starting Telegram platform...");

    let handler = Update::filter_message()
        .filter_map(move |msg: Message| {
            if allowed_chat_ids.is_empty() || allowed_chat_ids.contains(&msg.chat.id.0) {
                Some(msg)
            } else {
                None
            }
        })
        .endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![router])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(msg: Message, router: Arc<Router>) -> ResponseResult<()> {
    if let Some(event) = to_event(&msg) {
        router.route_message(event).await;
    }
    Ok(())
}

fn to_event(msg: &Message) -> Option<NormalizedEvent> {
    let user = msg.from.as_ref()?;
    let media = extract_media(msg);
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default();
    if text.is_empty() && media.is_none() {
        return None;
    }

    let mut event = NormalizedEvent::new(
        Platform::Telegram,
        msg.chat.id.0.to_string(),
        user.id.0.to_string(),
        !msg.chat.is_private(),
        text,
    );
    if let Some(media) = media {
        event = event.with_media(media);
    }
    // Bots cannot see each other's messages in most chats; the ones that do
    // reach us are relays and must not bounce back
    if user.is_bot {
        event = event.relayed();
    }
    Some(event)
}

fn extract_media(msg: &Message) -> Option<Media> {
    let (media_type, file, mime_type): (MediaType, &FileMeta, Option<String>) =
        if let Some(photos) = msg.photo() {
            (MediaType::Image, &photos.last()?.file, None)
        } else if let Some(doc) = msg.document() {
            (
                MediaType::Document,
                &doc.file,
                doc.mime_type.as_ref().map(|m| m.to_string()),
            )
        } else if let Some(audio) = msg.audio() {
            (
                MediaType::Audio,
                &audio.file,
                audio.mime_type.as_ref().map(|m| m.to_string()),
            )
        } else if let Some(voice) = msg.voice() {
            (
                MediaType::Audio,
                &voice.file,
                voice.mime_type.as_ref().map(|m| m.to_string()),
            )
        } else if let Some(video) = msg.video() {
            (
                MediaType::Video,
                &video.file,
                video.mime_type.as_ref().map(|m| m.to_string()),
            )
        } else if let Some(sticker) = msg.sticker() {
            (MediaType::Sticker, &sticker.file, None)
        } else {
            return None;
        };

    let mut media = Media::new(media_type, file.id.0.clone());
    media.caption = msg.caption().map(str::to_string);
    media.mime_type = mime_type;
    media.size = Some(u64::from(file.size));
    Some(media)
}

/// Outbound side: text and media delivery through the Bot API
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.bot
                .send_message(chat, chunk)
                .await
                .context("Failed to send Telegram message")?;
        }
        Ok(())
    }

    async fn send_media(
        &self,
        chat: ChatId,
        text: &str,
        media: &Media,
        url: reqwest::Url,
    ) -> Result<()> {
        let file = InputFile::url(url);
        let caption = (!text.is_empty() && text.chars().count() <= MAX_CAPTION_LEN)
            .then(|| text.to_string());
        let captioned = caption.is_some() || text.is_empty();

        match media.media_type {
            MediaType::Image => {
                let request = self.bot.send_photo(chat, file);
                let sent = match caption {
                    Some(c) => request.caption(c).await,
                    None => request.await,
                };
                sent.context("Failed to send Telegram photo")?;
            }
            MediaType::Document => {
                let request = self.bot.send_document(chat, file);
                let sent = match caption {
                    Some(c) => request.caption(c).await,
                    None => request.await,
                };
                sent.context("Failed to send Telegram document")?;
            }
            MediaType::Audio => {
                let request = self.bot.send_audio(chat, file);
                let sent = match caption {
                    Some(c) => request.caption(c).await,
                    None => request.await,
                };
                sent.context("Failed to send Telegram audio")?;
            }
            MediaType::Video => {
                let request = self.bot.send_video(chat, file);
                let sent = match caption {
                    Some(c) => request.caption(c).await,
                    None => request.await,
                };
                sent.context("Failed to send Telegram video")?;
            }
            MediaType::Sticker => {
                self.bot
                    .send_sticker(chat, file)
                    .await
                    .context("Failed to send Telegram sticker")?;
                if !text.is_empty() {
                    return self.send_text(chat, text).await;
                }
                return Ok(());
            }
        }

        if !captioned {
            self.send_text(chat, text).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn send(&self, chat_id: &str, text: &str, media: Option<&Media>) -> Result<()> {
        let chat = ChatId(
            chat_id
                .parse::<i64>()
                .with_context(|| format!("Invalid Telegram chat id: {}", chat_id))?,
        );

        let Some(media) = media else {
            return self.send_text(chat, text).await;
        };

        match remote_url(&media.url) {
            Some(url) => self.send_media(chat, text, media, url).await,
            None => {
                // File ids from other platforms mean nothing to the Bot API
                let note = format!("{}\n[{} not transferable]", text, media.media_type);
                self.send_text(chat, note.trim_start()).await
            }
        }
    }
}

fn remote_url(reference: &str) -> Option<reqwest::Url> {
    reqwest::Url::parse(reference)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}
