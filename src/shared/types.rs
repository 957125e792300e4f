//! Core data model shared between the engine and its clients.
//!
//! These types mirror what the persistence store hands back: a message is
//! always broadcast fully hydrated (sender summary, chat summary, per-member
//! delivery status, attachment and reply summaries where present).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message content category, derived from the MIME type for file sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    File,
}

impl MessageType {
    /// Map a MIME type onto a message category.
    ///
    /// `image/*`, `video/*` and `audio/*` map by prefix; anything mentioning
    /// `pdf` becomes a document; everything else is a generic file.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.contains("pdf") {
            Self::Document
        } else {
            Self::File
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

/// Per-recipient delivery state for one message.
///
/// `Sent` is assigned to the sender's own row at creation and never
/// transitions afterwards. Recipients start at `Delivered` and may be moved
/// to `Read` by an explicit client request. The lattice is monotonic:
/// `Read` never regresses to `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// Position in the delivery lattice, used to reject regressions.
    pub fn rank(self) -> u8 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }
}

/// Chat kind as stored by the membership collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
}

/// Display fields for an identity, as embedded in broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub profile_pic: Option<String>,
}

/// Display fields for a chat, as embedded in broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: i64,
    pub chat_name: Option<String>,
    pub chat_type: ChatType,
    pub chat_image: Option<String>,
}

/// A stored attachment. One-to-one with its message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: i64,
    pub file_url: String,
    pub original_filename: String,
    pub file_type: String,
    pub file_size: u64,
}

/// One (message, recipient) delivery-status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRow {
    pub user_id: i64,
    pub status: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// Short form of a replied-to message, embedded in the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySummary {
    pub message_id: i64,
    pub message_text: Option<String>,
    pub sender: UserSummary,
}

/// A fully hydrated message as returned by the persistence pipeline and
/// broadcast to chat rooms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydratedMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub sender: UserSummary,
    pub chat: ChatSummary,
    pub message_text: Option<String>,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub status: Vec<StatusRow>,
}

/// Presence snapshot entry returned by `get_online_users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub profile_pic: Option<String>,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}
