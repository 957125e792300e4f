//! Push Notification Dispatch
//!
//! Every non-sender member of a chat gets a message summary through an
//! external push service, which decides whether a device needs waking. The
//! call sits on the non-critical path: the engine fires it after the
//! broadcast and a failure is logged, never surfaced to the sender.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::shared::MessageType;

/// Summary of a delivered message, sent to the push service.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessageNote {
    pub chat_id: i64,
    pub chat_name: Option<String>,
    pub sender_id: i64,
    pub sender_username: String,
    pub message_type: MessageType,
    pub message_text: Option<String>,
    /// Every member of the chat except the sender.
    pub recipient_ids: Vec<i64>,
}

/// Outbound push notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_new_message(&self, note: NewMessageNote) -> Result<(), String>;
}

/// Posts message summaries to a configured webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_new_message(&self, note: NewMessageNote) -> Result<(), String> {
        debug!(
            "[Notify] Pushing message summary for chat {} to {} recipients",
            note.chat_id,
            note.recipient_ids.len()
        );
        let response = self
            .client
            .post(&self.url)
            .json(&note)
            .send()
            .await
            .map_err(|e| format!("Push request failed: {}", e))?;

        if !response.status().is_success() {
            warn!("[Notify] Push service returned {}", response.status());
            return Err(format!("Push service returned {}", response.status()));
        }
        Ok(())
    }
}

/// No-op notifier for runs without a push service configured.
#[derive(Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_new_message(&self, _note: NewMessageNote) -> Result<(), String> {
        Ok(())
    }
}
