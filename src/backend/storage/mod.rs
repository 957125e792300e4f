//! Storage interface for the fan-out engine.
//!
//! All durable state (messages, delivery status, visibility, membership,
//! presence flags) lives behind the [`ChatStore`] trait; the engine only
//! orchestrates writes and reads rows back for broadcast. Two
//! implementations ship here: a Postgres store backed by sqlx and an
//! in-memory store used when no database is configured and by the test
//! suite.
//!
//! [`ChatStore::create_message`] is the one compound operation: it must
//! behave as a single logical transaction (message + per-member delivery
//! status + per-member visibility + chat auto-restore + optional attachment)
//! so a failure never leaves a partially persisted message to broadcast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::shared::types::{ChatSummary, DeliveryState, HydratedMessage, StatusRow, UserSummary};
use crate::shared::MessageType;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Database driver failure.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// Attachment fields for a new message, already persisted to blob storage.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_url: String,
    pub original_filename: String,
    pub file_type: String,
    pub file_size: u64,
}

/// Input to [`ChatStore::create_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub sender_id: i64,
    pub message_text: Option<String>,
    pub message_type: MessageType,
    pub reply_to_id: Option<i64>,
    pub attachment: Option<NewAttachment>,
}

/// Minimal message lookup used by the reconciler and reply validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBrief {
    pub message_id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
}

/// The engine's view of durable chat state.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Look up display fields for an identity.
    async fn get_user(&self, user_id: i64) -> Result<Option<UserSummary>, StoreError>;

    /// Chats the identity is currently a member of.
    async fn chats_for_user(&self, user_id: i64) -> Result<Vec<ChatSummary>, StoreError>;

    /// Membership gate backing lookup.
    async fn is_member(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError>;

    /// Current member ids of a chat.
    async fn member_ids(&self, chat_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Whether the identity administers the chat (group admin).
    async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError>;

    /// Persist a message with all dependent rows as one logical transaction
    /// and return it fully hydrated. Delivery status is `sent` for the
    /// sender and `delivered` for every other current member; visibility
    /// starts `true` for everyone. A chat soft-deleted (hidden, not
    /// archived) for any member is restored to visible.
    async fn create_message(&self, new: NewMessage) -> Result<HydratedMessage, StoreError>;

    /// Locate a message's chat and sender.
    async fn message_brief(&self, message_id: i64) -> Result<Option<MessageBrief>, StoreError>;

    /// Current delivery-status row for (message, user), if any.
    async fn delivery_status(
        &self,
        message_id: i64,
        user_id: i64,
    ) -> Result<Option<StatusRow>, StoreError>;

    /// Overwrite the delivery-status row and return the new timestamp.
    /// Fails with `NotFound` when no row exists for the pair.
    async fn set_delivery_status(
        &self,
        message_id: i64,
        user_id: i64,
        status: DeliveryState,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Set the user's visibility row for a message to hidden. Idempotent;
    /// fails with `NotFound` only when the row does not exist at all.
    async fn hide_for_user(&self, message_id: i64, user_id: i64) -> Result<(), StoreError>;

    /// Number of members who still see the message.
    async fn visible_count(&self, message_id: i64) -> Result<u64, StoreError>;

    /// File URLs attached to a message, for blob cleanup before deletion.
    async fn attachment_urls(&self, message_id: i64) -> Result<Vec<String>, StoreError>;

    /// Hard-delete a message and its dependent rows in dependency order:
    /// visibility, delivery status, attachments, then the message itself.
    async fn delete_message_cascade(&self, message_id: i64) -> Result<(), StoreError>;

    /// Best-effort presence flag write. The in-memory registry stays
    /// authoritative regardless of this call's outcome.
    async fn set_online(&self, user_id: i64, online: bool) -> Result<(), StoreError>;

    /// Update the identity's profile status message.
    async fn set_status_message(&self, user_id: i64, status_message: &str)
        -> Result<(), StoreError>;
}
