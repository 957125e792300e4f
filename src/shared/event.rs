//! Wire events for the persistent per-connection channel.
//!
//! Every frame on the WebSocket is one JSON object:
//!
//! ```json
//! {"event": "send_message", "data": { ... }}
//! ```
//!
//! Both directions are closed, internally tagged enums so that an unhandled
//! event name is a compile-time hole in a `match`, not a silently ignored
//! string. Field names follow the client wire format, which mixes snake_case
//! and camelCase (`tempId`, `fileBuffer`, `chunkIndex`); the camelCase fields
//! carry explicit serde renames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ChatSummary, HydratedMessage, OnlineUser, UserSummary};
use super::DeliveryState;

/// Inbound payload for `send_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub chat_id: i64,
    pub message_text: String,
    #[serde(default)]
    pub message_type: Option<crate::shared::MessageType>,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
    #[serde(rename = "tempId")]
    pub temp_id: String,
}

/// Inbound payload for `send_file_message` (single-frame upload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendFilePayload {
    pub chat_id: i64,
    #[serde(default)]
    pub message_text: Option<String>,
    /// Base64-encoded file bytes.
    #[serde(rename = "fileBuffer")]
    pub file_buffer: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "fileType")]
    pub file_type: String,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    #[serde(rename = "tempId")]
    pub temp_id: String,
}

/// Inbound payload for `send_file_message_chunk`.
///
/// The metadata fields (`chat_id`, `fileName`, …) are only required on the
/// first chunk; later chunks may omit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    #[serde(rename = "tempId")]
    pub temp_id: String,
    /// Base64 fragment for this slot.
    #[serde(rename = "chunkData")]
    pub chunk_data: String,
    #[serde(rename = "chunkIndex")]
    pub chunk_index: usize,
    #[serde(rename = "totalChunks")]
    pub total_chunks: usize,
    #[serde(rename = "isFirstChunk", default)]
    pub is_first_chunk: bool,
    #[serde(rename = "isLastChunk", default)]
    pub is_last_chunk: bool,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(rename = "fileName", default)]
    pub file_name: Option<String>,
    #[serde(rename = "fileSize", default)]
    pub file_size: Option<u64>,
    #[serde(rename = "fileType", default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub message_text: Option<String>,
}

/// Inbound payload for `update_message_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusPayload {
    pub message_id: i64,
    pub status: DeliveryState,
}

/// Inbound payload for the two delete events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub message_id: i64,
}

/// Inbound payload for `join_chat` / `leave_chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRef {
    pub chat_id: i64,
}

/// Inbound payload for typing indicators. The engine trusts the
/// authenticated identity, not these client-supplied fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub chat_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Inbound payload for `update_status` (profile status message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessagePayload {
    pub status_message: String,
}

/// Empty payload for events that carry no data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

/// Every event a client may send, matched exhaustively by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(SendMessagePayload),
    SendFileMessage(SendFilePayload),
    SendFileMessageChunk(FileChunkPayload),
    UpdateMessageStatus(UpdateStatusPayload),
    DeleteMessageForAll(DeletePayload),
    DeleteMessageForUser(DeletePayload),
    JoinChat(ChatRef),
    LeaveChat(ChatRef),
    TypingStart(TypingPayload),
    TypingStop(TypingPayload),
    UpdateStatus(StatusMessagePayload),
    GetOnlineUsers(Empty),
}

/// Scoped error payload. `temp_id` is echoed where the failed operation
/// carried a correlation id so the client can reconcile optimistic state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(rename = "tempId", skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), details: None, temp_id: None }
    }

    pub fn with_temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Broadcast payload for `new_message`: the hydrated message plus the
/// sender's correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    #[serde(flatten)]
    pub message: HydratedMessage,
    #[serde(rename = "tempId", skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

/// Sender-only durability confirmation for `message_sent` and
/// `file_upload_success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAckPayload {
    pub message_id: i64,
    #[serde(rename = "tempId")]
    pub temp_id: String,
    pub status: DeliveryState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdatedPayload {
    pub message_id: i64,
    pub user_id: i64,
    pub status: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeletedPayload {
    pub message_id: i64,
    pub chat_id: i64,
    pub deleted_by_user_id: i64,
    /// `sender`, `admin` or `auto_cascade`.
    pub deleted_by_type: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSuccessPayload {
    pub message: String,
    pub message_id: i64,
    pub removed_from_db: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: i64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub status: String,
    #[serde(rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub message: String,
    pub user: UserSummary,
    pub chats: Vec<ChatSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMemberEventPayload {
    pub user_id: i64,
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingBroadcastPayload {
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessageBroadcastPayload {
    pub user_id: i64,
    pub status_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAckPayload {
    #[serde(rename = "tempId")]
    pub temp_id: String,
    #[serde(rename = "chunkIndex")]
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgressPayload {
    /// Percentage of declared chunks received, 0-100.
    pub progress: u8,
    #[serde(rename = "tempId")]
    pub temp_id: String,
}

/// Every event the engine may emit to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected(ConnectedPayload),
    NewMessage(NewMessagePayload),
    MessageSent(SendAckPayload),
    FileUploadSuccess(SendAckPayload),
    MessageError(ErrorPayload),
    FileUploadError(ErrorPayload),
    StatusError(ErrorPayload),
    DeleteError(ErrorPayload),
    DeleteSuccess(DeleteSuccessPayload),
    MessageStatusUpdated(StatusUpdatedPayload),
    MessageDeletedForAll(MessageDeletedPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    UserStatusUpdated(StatusMessageBroadcastPayload),
    UserTyping(TypingBroadcastPayload),
    UserStoppedTyping(TypingBroadcastPayload),
    ChatJoined(ChatRef),
    UserJoinedChat(ChatMemberEventPayload),
    UserLeftChat(ChatMemberEventPayload),
    OnlineUsers(Vec<OnlineUser>),
    FileChunkAck(ChunkAckPayload),
    FileUploadProgressUpdate(UploadProgressPayload),
}
