//! Status & Deletion Reconciler
//!
//! Delivery-state transitions and the two deletion flows. Delivery state
//! only moves forward (sent, delivered, read); a regression request is
//! answered with the current state and never broadcast. Deletion for
//! everyone requires the sender or a group admin; per-user deletion hides
//! the message and escalates to a hard cascade once nobody sees it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::backend::blob::BlobStore;
use crate::backend::error::EngineError;
use crate::backend::storage::ChatStore;
use crate::shared::DeliveryState;

/// Who a for-everyone deletion was attributed to on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleterRole {
    Sender,
    Admin,
    /// Every member hid the message, so the reconciler removed it.
    AutoCascade,
}

impl DeleterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Admin => "admin",
            Self::AutoCascade => "auto_cascade",
        }
    }
}

/// Result of a status transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusOutcome {
    pub chat_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub status: DeliveryState,
    pub updated_at: DateTime<Utc>,
    /// False when the request regressed the state and nothing was written.
    pub applied: bool,
}

/// Result of `delete_message_for_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionOutcome {
    pub chat_id: i64,
    pub message_id: i64,
    pub role: DeleterRole,
}

/// Result of `delete_message_for_user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HideOutcome {
    pub chat_id: i64,
    pub message_id: i64,
    /// True when the hide left no viewer and the row cascade ran.
    pub removed_from_db: bool,
}

/// Applies status transitions and deletions against the store.
pub struct StatusReconciler {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn ChatStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Move the requester's delivery state for a message forward.
    ///
    /// `sent` is never a valid target; it belongs to the sender's own row at
    /// creation. Equal-state requests refresh the timestamp and are treated
    /// as applied so clients converge after a reconnect.
    pub async fn set_status(
        &self,
        user_id: i64,
        message_id: i64,
        requested: DeliveryState,
    ) -> Result<StatusOutcome, EngineError> {
        if requested == DeliveryState::Sent {
            return Err(EngineError::validation(
                "status",
                "status must be 'delivered' or 'read'",
            ));
        }
        let brief = self
            .store
            .message_brief(message_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Message", message_id))?;
        let current = self
            .store
            .delivery_status(message_id, user_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Status record", message_id))?;

        if requested.rank() < current.status.rank() {
            // Never regress; answer with what we have.
            return Ok(StatusOutcome {
                chat_id: brief.chat_id,
                message_id,
                user_id,
                status: current.status,
                updated_at: current.updated_at,
                applied: false,
            });
        }

        let updated_at = self.store.set_delivery_status(message_id, user_id, requested).await?;
        info!(
            "[Reconcile] Message {} status for user {} -> {:?}",
            message_id, user_id, requested
        );
        Ok(StatusOutcome {
            chat_id: brief.chat_id,
            message_id,
            user_id,
            status: requested,
            updated_at,
            applied: true,
        })
    }

    /// Hard-delete a message for every member. Sender or group admin only.
    pub async fn delete_for_all(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<DeletionOutcome, EngineError> {
        let brief = self
            .store
            .message_brief(message_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Message", message_id))?;

        let role = if brief.sender_id == user_id {
            DeleterRole::Sender
        } else if self.store.is_admin(brief.chat_id, user_id).await? {
            DeleterRole::Admin
        } else {
            return Err(EngineError::Forbidden(
                "Only the sender or a group admin can delete this message for everyone".into(),
            ));
        };

        self.remove_blobs(message_id).await;
        self.store.delete_message_cascade(message_id).await?;
        info!(
            "[Reconcile] Message {} deleted for all by user {} ({})",
            message_id,
            user_id,
            role.as_str()
        );
        Ok(DeletionOutcome { chat_id: brief.chat_id, message_id, role })
    }

    /// Hide a message for the requester only. When the last viewer hides
    /// it, the whole record cascades away.
    pub async fn delete_for_user(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<HideOutcome, EngineError> {
        let brief = self
            .store
            .message_brief(message_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Message", message_id))?;
        if !self.store.is_member(brief.chat_id, user_id).await? {
            return Err(EngineError::NotAMember { chat_id: brief.chat_id });
        }

        self.store.hide_for_user(message_id, user_id).await?;

        let removed_from_db = if self.store.visible_count(message_id).await? == 0 {
            self.remove_blobs(message_id).await;
            self.store.delete_message_cascade(message_id).await?;
            info!("[Reconcile] Message {} cascaded after last viewer hid it", message_id);
            true
        } else {
            false
        };

        Ok(HideOutcome { chat_id: brief.chat_id, message_id, removed_from_db })
    }

    /// Best-effort attachment cleanup ahead of a cascade. A blob failure
    /// never blocks the deletion.
    async fn remove_blobs(&self, message_id: i64) {
        let urls = match self.store.attachment_urls(message_id).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!("[Reconcile] Could not list attachments for {}: {}", message_id, e);
                return;
            }
        };
        for url in urls {
            if let Err(e) = self.blobs.remove(&url).await {
                warn!("[Reconcile] Blob cleanup failed for {}: {}", url, e);
            }
        }
    }
}
