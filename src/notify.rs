//! Outbound alerting: the notifier seam, the Telegram implementation, and
//! the deduplicating dispatcher in front of them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::core::types::{NotificationEvent, Slot};
use crate::core::SentinelError;

/// Opaque `send(text)` capability. Failures are reported, never retried —
/// a flaky channel must not turn into a notification storm.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), SentinelError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Telegram
// ─────────────────────────────────────────────────────────────────────────────

pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: Url,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(
        client: reqwest::Client,
        bot_token: &str,
        chat_id: impl Into<String>,
    ) -> Result<Self, SentinelError> {
        let endpoint = Url::parse(&format!(
            "https://api.telegram.org/bot{bot_token}/sendMessage"
        ))
        .map_err(|e| SentinelError::Notify(format!("bad telegram endpoint: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), SentinelError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await
            .map_err(|e| SentinelError::Notify(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SentinelError::Notify(format!(
                "telegram responded {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Deduplicating layer in front of the notifier: at most one outbound alert
/// per distinct (date, time, facility) key within a run. The seen-set lives
/// only in memory, so a restart may re-alert — accepted limitation.
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    seen: HashSet<String>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            seen: HashSet::new(),
        }
    }

    /// Forward every not-yet-alerted slot. Returns how many alerts actually
    /// went out. A send failure still marks the key as seen — at-most-once
    /// beats maybe-twice for a channel that is itself rate-limited.
    pub async fn dispatch(&mut self, matches: &[Slot]) -> usize {
        let mut sent = 0;
        for slot in matches {
            let key = slot.dedup_key();
            if self.seen.contains(&key) {
                continue;
            }
            let event = NotificationEvent::new(slot.clone());
            match self.notifier.send(&event.message()).await {
                Ok(()) => {
                    info!("alerted: {}", event.slot);
                    sent += 1;
                }
                Err(e) => warn!("notification failed (not retried): {e}"),
            }
            self.seen.insert(key);
        }
        sent
    }

    /// Final operator-facing message before the process exits on a fatal
    /// error. Bypasses dedup; best effort.
    pub async fn announce_fatal(&self, error: &SentinelError) {
        let text = format!("slot-sentinel stopping: {error}");
        if let Err(e) = self.notifier.send(&text).await {
            warn!("could not deliver fatal notice: {e}");
        }
    }
}
