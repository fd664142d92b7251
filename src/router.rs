use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::notify::{failure_message, AdminNotifier};
use crate::platform::{NormalizedEvent, Platform};
use crate::plugins::{panic_message, PluginPipeline};
use crate::storage::{Session, SessionStore};

/// Single entry point for inbound events.
///
/// `route_message` never fails: session persistence is advisory, plugin
/// failures stay inside the pipeline, and a panic anywhere in the pass is
/// logged and reported to the admin sink in the background.
pub struct Router {
    pipeline: Arc<PluginPipeline>,
    sessions: Arc<dyn SessionStore>,
    notifier: Arc<dyn AdminNotifier>,
}

impl Router {
    pub fn new(
        pipeline: Arc<PluginPipeline>,
        sessions: Arc<dyn SessionStore>,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        Self {
            pipeline,
            sessions,
            notifier,
        }
    }

    pub async fn route_message(&self, mut event: NormalizedEvent) {
        let platform = event.platform();
        let chat_id = event.chat_id().to_string();
        let label = format!(
            "{}({}){}",
            platform.as_str().to_uppercase(),
            chat_id,
            if event.is_group() { " [GROUP]" } else { "" }
        );
        match &event.media {
            Some(media) => info!("{}: {} [MEDIA: {}]", label, event.text, media.media_type),
            None => info!("{}: {}", label, event.text),
        }

        let outcome = AssertUnwindSafe(self.process(&mut event))
            .catch_unwind()
            .await;

        if let Err(panic) = outcome {
            let error = format!("panicked: {}", panic_message(panic.as_ref()));
            self.report_failure(&label, platform, &chat_id, &error);
        }
    }

    /// Log a failed pass and notify the admin sink in the background
    fn report_failure(&self, label: &str, platform: Platform, chat_id: &str, error: &str) {
        error!("{} Processing error: {}", label, error);
        let notifier = Arc::clone(&self.notifier);
        let message = failure_message(platform, chat_id, error);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&message).await {
                warn!("Admin notification failed: {:#}", e);
            }
        });
    }

    async fn process(&self, event: &mut NormalizedEvent) {
        let session = session_for(event);
        let saved = AssertUnwindSafe(self.sessions.save_session(&session))
            .catch_unwind()
            .await;
        let failure = match saved {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
        };
        if let Some(reason) = failure {
            warn!(
                "Failed to save session for {}:{}: {}",
                event.platform(),
                event.chat_id(),
                reason
            );
        }

        let failures = self.pipeline.process(event).await;
        if failures > 0 {
            warn!(
                "{} of {} plugins failed for {}({})",
                failures,
                self.pipeline.count(),
                event.platform(),
                event.chat_id()
            );
        }
    }
}

fn session_for(event: &NormalizedEvent) -> Session {
    let mut metadata = Map::new();
    metadata.insert("sender".to_string(), Value::from(event.sender_id()));
    metadata.insert("isGroup".to_string(), Value::from(event.is_group()));
    metadata.insert("lastSeen".to_string(), json!(event.timestamp().to_rfc3339()));

    let mut session = Session::new(event.platform(), event.chat_id());
    session.last_message = Some(event.text.clone());
    session.last_media_id = event.media.as_ref().map(|m| m.url.clone());
    session.metadata = metadata;
    session.last_active = event.timestamp();
    session
}
