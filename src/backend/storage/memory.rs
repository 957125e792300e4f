//! In-memory [`ChatStore`] implementation.
//!
//! Used when no `DATABASE_URL` is configured (the server degrades instead of
//! refusing to start) and by the test suite. One mutex guards the whole
//! dataset, which makes `create_message` trivially atomic; nothing here is
//! held across an await point.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::shared::types::{
    Attachment, ChatSummary, ChatType, DeliveryState, HydratedMessage, ReplySummary, StatusRow,
    UserSummary,
};
use crate::shared::MessageType;

use super::{ChatStore, MessageBrief, NewMessage, StoreError};

#[derive(Debug, Clone)]
struct StoredUser {
    summary: UserSummary,
    is_online: bool,
    last_seen: Option<DateTime<Utc>>,
    status_message: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: i64,
    chat_id: i64,
    sender_id: i64,
    message_text: Option<String>,
    message_type: MessageType,
    reply_to_id: Option<i64>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct ChatVisibilityRow {
    is_visible: bool,
    is_archived: bool,
    hidden_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<i64, StoredUser>,
    chats: HashMap<i64, ChatSummary>,
    members: HashMap<i64, Vec<i64>>,
    admins: HashSet<(i64, i64)>,
    chat_visibility: HashMap<(i64, i64), ChatVisibilityRow>,
    messages: BTreeMap<i64, StoredMessage>,
    statuses: HashMap<(i64, i64), StatusRow>,
    visibility: HashMap<(i64, i64), (bool, Option<DateTime<Utc>>)>,
    attachments: HashMap<i64, Attachment>,
    next_user_id: i64,
    next_chat_id: i64,
    next_message_id: i64,
    next_attachment_id: i64,
}

/// Process-local store. Message ids are monotonically increasing.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user and return its id.
    pub fn add_user(&self, username: &str, full_name: Option<&str>) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_user_id += 1;
        let user_id = inner.next_user_id;
        inner.users.insert(
            user_id,
            StoredUser {
                summary: UserSummary {
                    user_id,
                    username: username.to_string(),
                    full_name: full_name.map(str::to_string),
                    profile_pic: None,
                },
                is_online: false,
                last_seen: None,
                status_message: None,
            },
        );
        user_id
    }

    /// Seed a chat with its members and return its id.
    pub fn add_chat(&self, chat_name: Option<&str>, chat_type: ChatType, members: &[i64]) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_chat_id += 1;
        let chat_id = inner.next_chat_id;
        inner.chats.insert(
            chat_id,
            ChatSummary {
                chat_id,
                chat_name: chat_name.map(str::to_string),
                chat_type,
                chat_image: None,
            },
        );
        inner.members.insert(chat_id, members.to_vec());
        for &user_id in members {
            inner.chat_visibility.insert(
                (chat_id, user_id),
                ChatVisibilityRow { is_visible: true, is_archived: false, hidden_at: None },
            );
        }
        chat_id
    }

    /// Grant group-admin rights in a chat.
    pub fn make_admin(&self, chat_id: i64, user_id: i64) {
        self.inner.lock().unwrap().admins.insert((chat_id, user_id));
    }

    /// Soft-delete (or archive) the chat for one member.
    pub fn hide_chat_for_user(&self, chat_id: i64, user_id: i64, archived: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.chat_visibility.insert(
            (chat_id, user_id),
            ChatVisibilityRow {
                is_visible: false,
                is_archived: archived,
                hidden_at: Some(Utc::now()),
            },
        );
    }

    /// Whether the chat is currently hidden for the member.
    pub fn chat_hidden(&self, chat_id: i64, user_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .chat_visibility
            .get(&(chat_id, user_id))
            .map(|row| !row.is_visible)
            .unwrap_or(false)
    }

    /// Whether the message row still exists.
    pub fn message_exists(&self, message_id: i64) -> bool {
        self.inner.lock().unwrap().messages.contains_key(&message_id)
    }

    /// All delivery-status rows for a message, ordered by user id.
    pub fn delivery_rows(&self, message_id: i64) -> Vec<StatusRow> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<StatusRow> = inner
            .statuses
            .iter()
            .filter(|((mid, _), _)| *mid == message_id)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|row| row.user_id);
        rows
    }

    /// Presence flag as persisted (not the registry's in-memory view).
    pub fn online_flag(&self, user_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .map(|u| u.is_online)
            .unwrap_or(false)
    }

    fn hydrate(inner: &Inner, message_id: i64) -> Result<HydratedMessage, StoreError> {
        let message = inner.messages.get(&message_id).ok_or(StoreError::NotFound("message"))?;
        let sender = inner
            .users
            .get(&message.sender_id)
            .map(|u| u.summary.clone())
            .ok_or(StoreError::NotFound("user"))?;
        let chat = inner
            .chats
            .get(&message.chat_id)
            .cloned()
            .ok_or(StoreError::NotFound("chat"))?;
        let reply_to = message.reply_to_id.and_then(|rid| {
            let referenced = inner.messages.get(&rid)?;
            let reply_sender = inner.users.get(&referenced.sender_id)?.summary.clone();
            Some(ReplySummary {
                message_id: rid,
                message_text: referenced.message_text.clone(),
                sender: reply_sender,
            })
        });
        let mut status: Vec<StatusRow> = inner
            .statuses
            .iter()
            .filter(|((mid, _), _)| *mid == message_id)
            .map(|(_, row)| row.clone())
            .collect();
        status.sort_by_key(|row| row.user_id);
        Ok(HydratedMessage {
            message_id,
            chat_id: message.chat_id,
            sender,
            chat,
            message_text: message.message_text.clone(),
            message_type: message.message_type,
            created_at: message.created_at,
            reply_to,
            attachment: inner.attachments.get(&message_id).cloned(),
            status,
        })
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserSummary>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(&user_id).map(|u| u.summary.clone()))
    }

    async fn chats_for_user(&self, user_id: i64) -> Result<Vec<ChatSummary>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut chats: Vec<ChatSummary> = inner
            .members
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .filter_map(|(chat_id, _)| inner.chats.get(chat_id).cloned())
            .collect();
        chats.sort_by_key(|c| c.chat_id);
        Ok(chats)
    }

    async fn is_member(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .members
            .get(&chat_id)
            .map(|m| m.contains(&user_id))
            .unwrap_or(false))
    }

    async fn member_ids(&self, chat_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self.inner.lock().unwrap().members.get(&chat_id).cloned().unwrap_or_default())
    }

    async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().admins.contains(&(chat_id, user_id)))
    }

    async fn create_message(&self, new: NewMessage) -> Result<HydratedMessage, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.chats.contains_key(&new.chat_id) {
            return Err(StoreError::NotFound("chat"));
        }
        let members = inner.members.get(&new.chat_id).cloned().unwrap_or_default();
        let now = Utc::now();

        inner.next_message_id += 1;
        let message_id = inner.next_message_id;
        inner.messages.insert(
            message_id,
            StoredMessage {
                message_id,
                chat_id: new.chat_id,
                sender_id: new.sender_id,
                message_text: new.message_text.clone(),
                message_type: new.message_type,
                reply_to_id: new.reply_to_id,
                created_at: now,
            },
        );

        for &user_id in &members {
            let status = if user_id == new.sender_id {
                DeliveryState::Sent
            } else {
                DeliveryState::Delivered
            };
            inner
                .statuses
                .insert((message_id, user_id), StatusRow { user_id, status, updated_at: now });
            inner.visibility.insert((message_id, user_id), (true, None));
        }

        if let Some(att) = new.attachment {
            inner.next_attachment_id += 1;
            let attachment_id = inner.next_attachment_id;
            inner.attachments.insert(
                message_id,
                Attachment {
                    attachment_id,
                    file_url: att.file_url,
                    original_filename: att.original_filename,
                    file_type: att.file_type,
                    file_size: att.file_size,
                },
            );
        }

        // New activity restores a soft-deleted chat, never an archived one.
        let chat_id = new.chat_id;
        for row in inner
            .chat_visibility
            .iter_mut()
            .filter(|((cid, _), _)| *cid == chat_id)
            .map(|(_, row)| row)
        {
            if !row.is_visible && !row.is_archived {
                row.is_visible = true;
                row.hidden_at = None;
            }
        }

        Self::hydrate(&inner, message_id)
    }

    async fn message_brief(&self, message_id: i64) -> Result<Option<MessageBrief>, StoreError> {
        Ok(self.inner.lock().unwrap().messages.get(&message_id).map(|m| MessageBrief {
            message_id: m.message_id,
            chat_id: m.chat_id,
            sender_id: m.sender_id,
        }))
    }

    async fn delivery_status(
        &self,
        message_id: i64,
        user_id: i64,
    ) -> Result<Option<StatusRow>, StoreError> {
        Ok(self.inner.lock().unwrap().statuses.get(&(message_id, user_id)).cloned())
    }

    async fn set_delivery_status(
        &self,
        message_id: i64,
        user_id: i64,
        status: DeliveryState,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .statuses
            .get_mut(&(message_id, user_id))
            .ok_or(StoreError::NotFound("message status"))?;
        let now = Utc::now();
        row.status = status;
        row.updated_at = now;
        Ok(now)
    }

    async fn hide_for_user(&self, message_id: i64, user_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .visibility
            .get_mut(&(message_id, user_id))
            .ok_or(StoreError::NotFound("message visibility"))?;
        if row.0 {
            *row = (false, Some(Utc::now()));
        }
        Ok(())
    }

    async fn visible_count(&self, message_id: i64) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .visibility
            .iter()
            .filter(|((mid, _), (visible, _))| *mid == message_id && *visible)
            .count() as u64)
    }

    async fn attachment_urls(&self, message_id: i64) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .attachments
            .get(&message_id)
            .map(|a| vec![a.file_url.clone()])
            .unwrap_or_default())
    }

    async fn delete_message_cascade(&self, message_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound("message"));
        }
        inner.visibility.retain(|(mid, _), _| *mid != message_id);
        inner.statuses.retain(|(mid, _), _| *mid != message_id);
        inner.attachments.remove(&message_id);
        inner.messages.remove(&message_id);
        Ok(())
    }

    async fn set_online(&self, user_id: i64, online: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NotFound("user"))?;
        user.is_online = online;
        user.last_seen = Some(Utc::now());
        Ok(())
    }

    async fn set_status_message(
        &self,
        user_id: i64,
        status_message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NotFound("user"))?;
        user.status_message = Some(status_message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryStore, i64, i64, i64) {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", Some("Alice A"));
        let bob = store.add_user("bob", None);
        let chat = store.add_chat(Some("pair"), ChatType::Private, &[alice, bob]);
        (store, alice, bob, chat)
    }

    #[tokio::test]
    async fn test_create_message_writes_status_per_member() {
        let (store, alice, bob, chat) = seeded();
        let message = store
            .create_message(NewMessage {
                chat_id: chat,
                sender_id: alice,
                message_text: Some("hi".into()),
                message_type: MessageType::Text,
                reply_to_id: None,
                attachment: None,
            })
            .await
            .unwrap();

        assert_eq!(message.status.len(), 2);
        let rows = store.delivery_rows(message.message_id);
        assert_eq!(rows[0].user_id, alice);
        assert_eq!(rows[0].status, DeliveryState::Sent);
        assert_eq!(rows[1].user_id, bob);
        assert_eq!(rows[1].status, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn test_message_ids_are_monotonic() {
        let (store, alice, _, chat) = seeded();
        let mut last = 0;
        for _ in 0..3 {
            let m = store
                .create_message(NewMessage {
                    chat_id: chat,
                    sender_id: alice,
                    message_text: Some("x".into()),
                    message_type: MessageType::Text,
                    reply_to_id: None,
                    attachment: None,
                })
                .await
                .unwrap();
            assert!(m.message_id > last);
            last = m.message_id;
        }
    }

    #[tokio::test]
    async fn test_create_message_restores_hidden_chat_but_not_archived() {
        let (store, alice, bob, chat) = seeded();
        let carol = store.add_user("carol", None);
        let other = store.add_chat(None, ChatType::Group, &[alice, bob, carol]);
        store.hide_chat_for_user(other, bob, false);
        store.hide_chat_for_user(other, carol, true);

        store
            .create_message(NewMessage {
                chat_id: other,
                sender_id: alice,
                message_text: Some("wake up".into()),
                message_type: MessageType::Text,
                reply_to_id: None,
                attachment: None,
            })
            .await
            .unwrap();

        assert!(!store.chat_hidden(other, bob), "soft-deleted chat should be restored");
        assert!(store.chat_hidden(other, carol), "archived chat must stay hidden");
    }

    #[tokio::test]
    async fn test_cascade_removes_all_dependents() {
        let (store, alice, bob, chat) = seeded();
        let message = store
            .create_message(NewMessage {
                chat_id: chat,
                sender_id: alice,
                message_text: Some("gone soon".into()),
                message_type: MessageType::Text,
                reply_to_id: None,
                attachment: None,
            })
            .await
            .unwrap();

        store.delete_message_cascade(message.message_id).await.unwrap();
        assert!(!store.message_exists(message.message_id));
        assert!(store.delivery_rows(message.message_id).is_empty());
        assert_eq!(store.visible_count(message.message_id).await.unwrap(), 0);
        let _ = bob;
    }

    #[tokio::test]
    async fn test_hide_for_user_is_idempotent() {
        let (store, alice, bob, chat) = seeded();
        let message = store
            .create_message(NewMessage {
                chat_id: chat,
                sender_id: alice,
                message_text: Some("hide me".into()),
                message_type: MessageType::Text,
                reply_to_id: None,
                attachment: None,
            })
            .await
            .unwrap();

        store.hide_for_user(message.message_id, bob).await.unwrap();
        store.hide_for_user(message.message_id, bob).await.unwrap();
        assert_eq!(store.visible_count(message.message_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_delivery_status_missing_row() {
        let (store, _, bob, _) = seeded();
        let err = store.set_delivery_status(999, bob, DeliveryState::Read).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
