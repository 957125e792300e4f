//! Fan-out Engine
//!
//! Ties the registry, pipeline, reconciler and upload assembler together
//! behind three entry points the socket layer calls: `handle_connect`,
//! `handle_event` and `handle_disconnect`. Every client-visible failure is
//! converted here into the scoped error event for the operation that
//! failed; dependency failures additionally get logged at error level.
//!
//! Broadcast ordering per send: room broadcast first, then the sender-only
//! ack, then the fire-and-forget push notification to the other members.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::backend::blob::BlobStore;
use crate::backend::error::EngineError;
use crate::backend::notify::{NewMessageNote, Notifier};
use crate::backend::pipeline::{FileUpload, MessagePipeline};
use crate::backend::reconcile::{DeleterRole, StatusReconciler};
use crate::backend::registry::{ConnectionId, ConnectionRegistry};
use crate::backend::storage::ChatStore;
use crate::backend::upload::{ChunkAssembler, ChunkOutcome};
use crate::shared::event::{
    ChatMemberEventPayload, ChatRef, ChunkAckPayload, ConnectedPayload, DeletePayload,
    DeleteSuccessPayload, ErrorPayload, FileChunkPayload, MessageDeletedPayload, NewMessagePayload,
    PresencePayload, SendAckPayload, SendFilePayload, SendMessagePayload,
    StatusMessageBroadcastPayload, StatusUpdatedPayload, TypingBroadcastPayload,
    UpdateStatusPayload, UploadProgressPayload,
};
use crate::shared::{ClientEvent, DeliveryState, HydratedMessage, OnlineUser, ServerEvent};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upload cap applied to decoded file bytes.
    pub max_file_bytes: u64,
    /// Bound on the presence write racing a disconnect.
    pub disconnect_write_timeout: Duration,
    /// How long a chunked upload may sit without a new chunk.
    pub upload_idle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * BYTES_PER_MIB,
            disconnect_write_timeout: Duration::from_secs(5),
            upload_idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Which scoped error event reports a failed operation.
#[derive(Debug, Clone, Copy)]
enum ErrorScope {
    Message,
    FileUpload,
    Status,
    Delete,
}

/// The message fan-out and delivery-state engine.
pub struct ChatEngine {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn Notifier>,
    pipeline: MessagePipeline,
    reconciler: StatusReconciler,
    uploads: ChunkAssembler,
    config: EngineConfig,
}

impl ChatEngine {
    pub fn new(
        store: Arc<dyn ChatStore>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let pipeline = MessagePipeline::new(store.clone(), blobs.clone(), config.max_file_bytes);
        let reconciler = StatusReconciler::new(store.clone(), blobs);
        Self {
            registry: ConnectionRegistry::new(),
            store,
            notifier,
            pipeline,
            reconciler,
            uploads: ChunkAssembler::new(config.max_file_bytes),
            config,
        }
    }

    /// Live-connection registry, shared with the socket layer.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Drop chunked uploads that stopped receiving data. Called from a
    /// periodic task.
    pub fn sweep_idle_uploads(&self) -> usize {
        self.uploads.sweep_idle(self.config.upload_idle_timeout)
    }

    /// Admit an authenticated connection: register it, join it to all of
    /// its chats' rooms, confirm, and announce presence if this identity
    /// just came online.
    pub async fn handle_connect(
        &self,
        user_id: i64,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<ConnectionId, EngineError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| EngineError::not_found("User", user_id))?;
        let chats = self.store.chats_for_user(user_id).await?;

        let (conn, already_online) = self.registry.register(user_id, sender);
        for chat in &chats {
            self.registry.join_room(conn, chat.chat_id);
        }

        // The registry is authoritative; the flag write is best effort.
        if let Err(e) = self.store.set_online(user_id, true).await {
            warn!("[Engine] Presence write failed for user {}: {}", user_id, e);
        }

        info!("[Engine] User {} ({}) connected as {:?}", user_id, user.username, conn);
        let payload = ConnectedPayload {
            message: "Connected successfully".into(),
            user: user.clone(),
            chats,
        };
        self.registry.send_to_connection(conn, ServerEvent::Connected(payload));

        if !already_online {
            let presence = PresencePayload {
                user_id,
                username: user.username,
                full_name: user.full_name,
                status: "online".into(),
                last_seen: None,
            };
            self.registry.broadcast_all(&ServerEvent::UserOnline(presence), Some(conn));
        }
        Ok(conn)
    }

    /// Tear down a connection. In-flight uploads die with it; presence only
    /// collapses when this was the identity's last connection, and the
    /// database write for it is time-bounded so a slow store cannot stall
    /// disconnect handling.
    pub async fn handle_disconnect(&self, conn: ConnectionId) {
        self.uploads.purge_connection(conn);
        let Some(gone) = self.registry.unregister(conn) else {
            return;
        };
        if !gone.last_for_user {
            return;
        }

        let user_id = gone.user_id;
        let write = self.store.set_online(user_id, false);
        match tokio::time::timeout(self.config.disconnect_write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[Engine] Offline write failed for user {}: {}", user_id, e),
            Err(_) => warn!("[Engine] Offline write timed out for user {}", user_id),
        }

        let username = match self.store.get_user(user_id).await {
            Ok(Some(user)) => user.username,
            _ => format!("user-{user_id}"),
        };
        info!("[Engine] User {} ({}) went offline", user_id, username);
        let presence = PresencePayload {
            user_id,
            username,
            full_name: None,
            status: "offline".into(),
            last_seen: Some(Utc::now()),
        };
        self.registry.broadcast_all(&ServerEvent::UserOffline(presence), None);
    }

    /// Dispatch one inbound frame. Failures never propagate: they are
    /// reported to the initiating connection on the operation's scoped
    /// error event.
    pub async fn handle_event(&self, conn: ConnectionId, event: ClientEvent) {
        let Some(user_id) = self.registry.user_of(conn) else {
            warn!("[Engine] Dropping event from unregistered connection {:?}", conn);
            return;
        };

        match event {
            ClientEvent::SendMessage(payload) => {
                let temp_id = payload.temp_id.clone();
                if let Err(e) = self.op_send_message(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::Message, e, Some(&temp_id));
                }
            }
            ClientEvent::SendFileMessage(payload) => {
                let temp_id = payload.temp_id.clone();
                if let Err(e) = self.op_send_file(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::FileUpload, e, Some(&temp_id));
                }
            }
            ClientEvent::SendFileMessageChunk(payload) => {
                let temp_id = payload.temp_id.clone();
                if let Err(e) = self.op_file_chunk(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::FileUpload, e, Some(&temp_id));
                }
            }
            ClientEvent::UpdateMessageStatus(payload) => {
                if let Err(e) = self.op_update_status(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::Status, e, None);
                }
            }
            ClientEvent::DeleteMessageForAll(payload) => {
                if let Err(e) = self.op_delete_for_all(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::Delete, e, None);
                }
            }
            ClientEvent::DeleteMessageForUser(payload) => {
                if let Err(e) = self.op_delete_for_user(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::Delete, e, None);
                }
            }
            ClientEvent::JoinChat(payload) => {
                if let Err(e) = self.op_join_chat(conn, user_id, payload).await {
                    self.report(conn, ErrorScope::Message, e, None);
                }
            }
            ClientEvent::LeaveChat(payload) => {
                self.op_leave_chat(conn, user_id, payload);
            }
            ClientEvent::TypingStart(payload) => {
                self.op_typing(conn, user_id, payload.chat_id, true).await;
            }
            ClientEvent::TypingStop(payload) => {
                self.op_typing(conn, user_id, payload.chat_id, false).await;
            }
            ClientEvent::UpdateStatus(payload) => {
                if let Err(e) = self.op_update_status_message(conn, user_id, &payload.status_message).await
                {
                    self.report(conn, ErrorScope::Status, e, None);
                }
            }
            ClientEvent::GetOnlineUsers(_) => {
                if let Err(e) = self.op_online_users(conn).await {
                    self.report(conn, ErrorScope::Message, e, None);
                }
            }
        }
    }

    async fn op_send_message(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: SendMessagePayload,
    ) -> Result<(), EngineError> {
        let temp_id = payload.temp_id.clone();
        let message = self.pipeline.send_text(user_id, &payload).await?;
        self.broadcast_message(conn, message, temp_id, false);
        Ok(())
    }

    async fn op_send_file(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: SendFilePayload,
    ) -> Result<(), EngineError> {
        // Reject on the declared size before paying for the decode.
        if payload.file_size > self.config.max_file_bytes {
            return Err(EngineError::FileTooLarge {
                size_mib: payload.file_size as f64 / BYTES_PER_MIB as f64,
                limit_mib: self.config.max_file_bytes / BYTES_PER_MIB,
            });
        }
        let temp_id = payload.temp_id.clone();
        let upload = FileUpload::from_frame(payload)?;
        let message = self.pipeline.send_file(user_id, upload).await?;
        self.broadcast_message(conn, message, temp_id, true);
        Ok(())
    }

    async fn op_file_chunk(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: FileChunkPayload,
    ) -> Result<(), EngineError> {
        let temp_id = payload.temp_id.clone();
        let chunk_index = payload.chunk_index;

        match self.uploads.ingest(conn, payload)? {
            ChunkOutcome::Accepted { progress } => {
                self.registry.send_to_connection(
                    conn,
                    ServerEvent::FileChunkAck(ChunkAckPayload {
                        temp_id: temp_id.clone(),
                        chunk_index,
                    }),
                );
                self.registry.send_to_connection(
                    conn,
                    ServerEvent::FileUploadProgressUpdate(UploadProgressPayload {
                        progress,
                        temp_id,
                    }),
                );
                Ok(())
            }
            ChunkOutcome::Complete(upload) => {
                self.registry.send_to_connection(
                    conn,
                    ServerEvent::FileChunkAck(ChunkAckPayload {
                        temp_id: temp_id.clone(),
                        chunk_index,
                    }),
                );
                self.registry.send_to_connection(
                    conn,
                    ServerEvent::FileUploadProgressUpdate(UploadProgressPayload {
                        progress: 100,
                        temp_id: temp_id.clone(),
                    }),
                );
                let message = self
                    .pipeline
                    .send_file(
                        user_id,
                        FileUpload {
                            chat_id: upload.chat_id,
                            message_text: upload.message_text,
                            file_name: upload.file_name,
                            file_type: upload.file_type,
                            bytes: upload.bytes,
                        },
                    )
                    .await?;
                self.broadcast_message(conn, message, temp_id, true);
                Ok(())
            }
        }
    }

    async fn op_update_status(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: UpdateStatusPayload,
    ) -> Result<(), EngineError> {
        let outcome = self
            .reconciler
            .set_status(user_id, payload.message_id, payload.status)
            .await?;
        let event = ServerEvent::MessageStatusUpdated(StatusUpdatedPayload {
            message_id: outcome.message_id,
            user_id: outcome.user_id,
            status: outcome.status,
            updated_at: outcome.updated_at,
        });
        if outcome.applied {
            self.registry.broadcast_to_chat(outcome.chat_id, &event, None);
        } else {
            // Regression request: only the requester learns the real state.
            self.registry.send_to_connection(conn, event);
        }
        Ok(())
    }

    async fn op_delete_for_all(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: DeletePayload,
    ) -> Result<(), EngineError> {
        let outcome = self.reconciler.delete_for_all(user_id, payload.message_id).await?;
        self.broadcast_deletion(outcome.chat_id, outcome.message_id, user_id, outcome.role);
        self.registry.send_to_connection(
            conn,
            ServerEvent::DeleteSuccess(DeleteSuccessPayload {
                message: "Message deleted for everyone".into(),
                message_id: outcome.message_id,
                removed_from_db: true,
            }),
        );
        Ok(())
    }

    async fn op_delete_for_user(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: DeletePayload,
    ) -> Result<(), EngineError> {
        let outcome = self.reconciler.delete_for_user(user_id, payload.message_id).await?;
        if outcome.removed_from_db {
            self.broadcast_deletion(
                outcome.chat_id,
                outcome.message_id,
                user_id,
                DeleterRole::AutoCascade,
            );
        }
        self.registry.send_to_connection(
            conn,
            ServerEvent::DeleteSuccess(DeleteSuccessPayload {
                message: "Message deleted for you".into(),
                message_id: outcome.message_id,
                removed_from_db: outcome.removed_from_db,
            }),
        );
        Ok(())
    }

    async fn op_join_chat(
        &self,
        conn: ConnectionId,
        user_id: i64,
        payload: ChatRef,
    ) -> Result<(), EngineError> {
        let member = self.store.is_member(payload.chat_id, user_id).await?;
        if !member {
            return Err(EngineError::NotAMember { chat_id: payload.chat_id });
        }
        self.registry.join_room(conn, payload.chat_id);
        self.registry
            .send_to_connection(conn, ServerEvent::ChatJoined(ChatRef { chat_id: payload.chat_id }));
        self.registry.broadcast_to_chat(
            payload.chat_id,
            &ServerEvent::UserJoinedChat(ChatMemberEventPayload {
                user_id,
                chat_id: payload.chat_id,
            }),
            Some(conn),
        );
        Ok(())
    }

    fn op_leave_chat(&self, conn: ConnectionId, user_id: i64, payload: ChatRef) {
        self.registry.leave_room(conn, payload.chat_id);
        self.registry.broadcast_to_chat(
            payload.chat_id,
            &ServerEvent::UserLeftChat(ChatMemberEventPayload { user_id, chat_id: payload.chat_id }),
            Some(conn),
        );
    }

    /// Typing indicators are pure fan-out; a failure to resolve the
    /// username is not worth an error event.
    async fn op_typing(&self, conn: ConnectionId, user_id: i64, chat_id: i64, started: bool) {
        if !self.registry.in_room(conn, chat_id) {
            return;
        }
        let username = match self.store.get_user(user_id).await {
            Ok(Some(user)) => Some(user.username),
            _ => None,
        };
        let payload = TypingBroadcastPayload { user_id, username, chat_id };
        let event = if started {
            ServerEvent::UserTyping(payload)
        } else {
            ServerEvent::UserStoppedTyping(payload)
        };
        self.registry.broadcast_to_chat(chat_id, &event, Some(conn));
    }

    async fn op_update_status_message(
        &self,
        conn: ConnectionId,
        user_id: i64,
        status_message: &str,
    ) -> Result<(), EngineError> {
        let trimmed = status_message.trim();
        if trimmed.is_empty() {
            return Err(EngineError::validation("status_message", "status_message is required"));
        }
        self.store.set_status_message(user_id, trimmed).await?;
        self.registry.broadcast_all(
            &ServerEvent::UserStatusUpdated(StatusMessageBroadcastPayload {
                user_id,
                status_message: trimmed.to_string(),
            }),
            Some(conn),
        );
        Ok(())
    }

    async fn op_online_users(&self, conn: ConnectionId) -> Result<(), EngineError> {
        let mut users = Vec::new();
        for user_id in self.registry.online_user_ids() {
            if let Some(user) = self.store.get_user(user_id).await? {
                users.push(OnlineUser {
                    user_id: user.user_id,
                    username: user.username,
                    full_name: user.full_name,
                    profile_pic: user.profile_pic,
                    status: "online".into(),
                    last_seen: Utc::now(),
                });
            }
        }
        self.registry.send_to_connection(conn, ServerEvent::OnlineUsers(users));
        Ok(())
    }

    /// Room broadcast, sender ack, then the push to every other member, in
    /// that order. The push runs detached so a slow webhook never delays
    /// acks; whether a recipient actually gets woken is the sink's policy.
    fn broadcast_message(
        &self,
        conn: ConnectionId,
        message: HydratedMessage,
        temp_id: String,
        is_file: bool,
    ) {
        let chat_id = message.chat_id;
        let file_url = message.attachment.as_ref().map(|a| a.file_url.clone());
        let recipients: Vec<i64> = message
            .status
            .iter()
            .map(|row| row.user_id)
            .filter(|&id| id != message.sender.user_id)
            .collect();
        let note = NewMessageNote {
            chat_id,
            chat_name: message.chat.chat_name.clone(),
            sender_id: message.sender.user_id,
            sender_username: message.sender.username.clone(),
            message_type: message.message_type,
            message_text: message.message_text.clone(),
            recipient_ids: recipients,
        };
        let ack = SendAckPayload {
            message_id: message.message_id,
            temp_id: temp_id.clone(),
            status: DeliveryState::Sent,
            timestamp: message.created_at,
            file_url,
        };

        self.registry.broadcast_to_chat(
            chat_id,
            &ServerEvent::NewMessage(NewMessagePayload { message, temp_id: Some(temp_id) }),
            None,
        );
        let ack_event = if is_file {
            ServerEvent::FileUploadSuccess(ack)
        } else {
            ServerEvent::MessageSent(ack)
        };
        self.registry.send_to_connection(conn, ack_event);

        if !note.recipient_ids.is_empty() {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.notify_new_message(note).await {
                    warn!("[Engine] Push notification failed: {}", e);
                }
            });
        }
    }

    fn broadcast_deletion(&self, chat_id: i64, message_id: i64, user_id: i64, role: DeleterRole) {
        self.registry.broadcast_to_chat(
            chat_id,
            &ServerEvent::MessageDeletedForAll(MessageDeletedPayload {
                message_id,
                chat_id,
                deleted_by_user_id: user_id,
                deleted_by_type: role.as_str().to_string(),
                deleted_at: Utc::now(),
            }),
            None,
        );
    }

    fn report(&self, conn: ConnectionId, scope: ErrorScope, err: EngineError, temp_id: Option<&str>) {
        if err.is_dependency() {
            error!("[Engine] Operation failed on a dependency: {}", err);
        } else {
            info!("[Engine] Rejected client request: {}", err);
        }
        let mut payload = ErrorPayload::new(err.to_string());
        if let Some(temp_id) = temp_id {
            payload = payload.with_temp_id(temp_id);
        }
        let event = match scope {
            ErrorScope::Message => ServerEvent::MessageError(payload),
            ErrorScope::FileUpload => ServerEvent::FileUploadError(payload),
            ErrorScope::Status => ServerEvent::StatusError(payload),
            ErrorScope::Delete => ServerEvent::DeleteError(payload),
        };
        self.registry.send_to_connection(conn, event);
    }
}
