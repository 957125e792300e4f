//! Message Persistence Pipeline
//!
//! Validates inbound sends, gates them on membership, persists through the
//! store and hands back the hydrated message for broadcast. File sends go
//! blob-first: bytes land in blob storage before any database row exists,
//! and a failed database write cleans the orphaned blob back up.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{error, info, warn};

use crate::backend::blob::BlobStore;
use crate::backend::error::EngineError;
use crate::backend::storage::{ChatStore, NewAttachment, NewMessage};
use crate::shared::event::{SendFilePayload, SendMessagePayload};
use crate::shared::{HydratedMessage, MessageType};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Decoded file-send input, shared by the single-frame and chunked paths.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub chat_id: i64,
    pub message_text: Option<String>,
    pub file_name: String,
    pub file_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    /// Decode a single-frame `send_file_message` payload.
    pub fn from_frame(payload: SendFilePayload) -> Result<Self, EngineError> {
        let bytes = BASE64
            .decode(payload.file_buffer.as_bytes())
            .map_err(|e| EngineError::validation("fileBuffer", format!("Invalid base64 data: {}", e)))?;
        Ok(Self {
            chat_id: payload.chat_id,
            message_text: payload.message_text,
            file_name: payload.file_name,
            file_type: payload.file_type,
            bytes,
        })
    }
}

/// Validation and persistence for sends.
pub struct MessagePipeline {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
    max_file_bytes: u64,
}

impl MessagePipeline {
    pub fn new(store: Arc<dyn ChatStore>, blobs: Arc<dyn BlobStore>, max_file_bytes: u64) -> Self {
        Self { store, blobs, max_file_bytes }
    }

    /// Validate and persist a text message.
    pub async fn send_text(
        &self,
        sender_id: i64,
        payload: &SendMessagePayload,
    ) -> Result<HydratedMessage, EngineError> {
        let text = payload.message_text.trim();
        if text.is_empty() {
            return Err(EngineError::validation(
                "message_text",
                "chat_id and message_text are required",
            ));
        }
        if payload.chat_id <= 0 {
            return Err(EngineError::validation(
                "chat_id",
                "chat_id and message_text are required",
            ));
        }
        self.require_membership(payload.chat_id, sender_id).await?;

        if let Some(reply_to_id) = payload.reply_to_id {
            let brief = self
                .store
                .message_brief(reply_to_id)
                .await
                .map_err(EngineError::Persistence)?;
            match brief {
                Some(b) if b.chat_id == payload.chat_id => {}
                _ => return Err(EngineError::InvalidReference),
            }
        }

        let message = self
            .store
            .create_message(NewMessage {
                chat_id: payload.chat_id,
                sender_id,
                message_text: Some(text.to_string()),
                message_type: payload.message_type.unwrap_or(MessageType::Text),
                reply_to_id: payload.reply_to_id,
                attachment: None,
            })
            .await
            .map_err(EngineError::Persistence)?;

        info!(
            "[Pipeline] Message {} persisted in chat {} by user {}",
            message.message_id, message.chat_id, sender_id
        );
        Ok(message)
    }

    /// Validate, store the blob, then persist a file message.
    pub async fn send_file(
        &self,
        sender_id: i64,
        upload: FileUpload,
    ) -> Result<HydratedMessage, EngineError> {
        if upload.file_name.trim().is_empty() {
            return Err(EngineError::validation("fileName", "fileName is required"));
        }
        if upload.bytes.is_empty() {
            return Err(EngineError::validation("fileBuffer", "File data is required"));
        }
        let size = upload.bytes.len() as u64;
        if size > self.max_file_bytes {
            return Err(EngineError::FileTooLarge {
                size_mib: size as f64 / BYTES_PER_MIB as f64,
                limit_mib: self.max_file_bytes / BYTES_PER_MIB,
            });
        }
        self.require_membership(upload.chat_id, sender_id).await?;

        let file_url = self
            .blobs
            .put(&upload.file_name, &upload.bytes)
            .await
            .map_err(EngineError::StorageWrite)?;

        let result = self
            .store
            .create_message(NewMessage {
                chat_id: upload.chat_id,
                sender_id,
                message_text: upload.message_text.clone(),
                message_type: MessageType::from_mime(&upload.file_type),
                reply_to_id: None,
                attachment: Some(NewAttachment {
                    file_url: file_url.clone(),
                    original_filename: upload.file_name.clone(),
                    file_type: upload.file_type.clone(),
                    file_size: size,
                }),
            })
            .await;

        match result {
            Ok(message) => {
                info!(
                    "[Pipeline] File message {} persisted in chat {} ({} bytes)",
                    message.message_id, message.chat_id, size
                );
                Ok(message)
            }
            Err(e) => {
                // Blob was written first; do not leave it orphaned.
                error!("[Pipeline] File message persist failed, removing blob: {}", e);
                if let Err(cleanup) = self.blobs.remove(&file_url).await {
                    warn!("[Pipeline] Orphan blob cleanup failed: {}", cleanup);
                }
                Err(EngineError::Persistence(e))
            }
        }
    }

    async fn require_membership(&self, chat_id: i64, user_id: i64) -> Result<(), EngineError> {
        let member = self
            .store
            .is_member(chat_id, user_id)
            .await
            .map_err(EngineError::Persistence)?;
        if !member {
            return Err(EngineError::NotAMember { chat_id });
        }
        Ok(())
    }
}
