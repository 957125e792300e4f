//! Postgres [`ChatStore`] implementation backed by sqlx.
//!
//! Queries use the runtime API with explicit binds so the crate builds
//! without a live database. `create_message` runs inside one transaction;
//! everything the broadcast layer needs is hydrated after commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::shared::types::{
    Attachment, ChatSummary, ChatType, DeliveryState, HydratedMessage, ReplySummary, StatusRow,
    UserSummary,
};
use crate::shared::MessageType;

use super::{ChatStore, MessageBrief, NewMessage, StoreError};

fn message_type_str(t: MessageType) -> &'static str {
    match t {
        MessageType::Text => "text",
        MessageType::Image => "image",
        MessageType::Video => "video",
        MessageType::Audio => "audio",
        MessageType::Document => "document",
        MessageType::File => "file",
    }
}

fn parse_message_type(s: &str) -> MessageType {
    match s {
        "image" => MessageType::Image,
        "video" => MessageType::Video,
        "audio" => MessageType::Audio,
        "document" => MessageType::Document,
        "file" => MessageType::File,
        _ => MessageType::Text,
    }
}

fn delivery_state_str(s: DeliveryState) -> &'static str {
    match s {
        DeliveryState::Sent => "sent",
        DeliveryState::Delivered => "delivered",
        DeliveryState::Read => "read",
    }
}

fn parse_delivery_state(s: &str) -> DeliveryState {
    match s {
        "sent" => DeliveryState::Sent,
        "read" => DeliveryState::Read,
        _ => DeliveryState::Delivered,
    }
}

fn parse_chat_type(s: &str) -> ChatType {
    if s == "group" {
        ChatType::Group
    } else {
        ChatType::Private
    }
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserSummary {
    UserSummary {
        user_id: row.get("user_id"),
        username: row.get("username"),
        full_name: row.get("full_name"),
        profile_pic: row.get("profile_pic"),
    }
}

fn chat_from_row(row: &sqlx::postgres::PgRow) -> ChatSummary {
    ChatSummary {
        chat_id: row.get("chat_id"),
        chat_name: row.get("chat_name"),
        chat_type: parse_chat_type(row.get::<String, _>("chat_type").as_str()),
        chat_image: row.get("chat_image"),
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, message_id: i64) -> Result<HydratedMessage, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT m.message_id, m.chat_id, m.message_text, m.message_type, m.created_at,
                   m.reply_to_id,
                   u.user_id, u.username, u.full_name, u.profile_pic,
                   c.chat_name, c.chat_type, c.chat_image
            FROM messages m
            JOIN users u ON u.user_id = m.sender_id
            JOIN chats c ON c.chat_id = m.chat_id
            WHERE m.message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("message"))?;

        let chat_id: i64 = row.get("chat_id");
        let reply_to_id: Option<i64> = row.get("reply_to_id");

        let reply_to = match reply_to_id {
            Some(rid) => sqlx::query(
                r#"
                SELECT m.message_id, m.message_text,
                       u.user_id, u.username, u.full_name, u.profile_pic
                FROM messages m
                JOIN users u ON u.user_id = m.sender_id
                WHERE m.message_id = $1
                "#,
            )
            .bind(rid)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| ReplySummary {
                message_id: r.get("message_id"),
                message_text: r.get("message_text"),
                sender: user_from_row(&r),
            }),
            None => None,
        };

        let attachment = sqlx::query(
            r#"
            SELECT attachment_id, file_url, original_filename, file_type, file_size
            FROM attachments WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|r| Attachment {
            attachment_id: r.get("attachment_id"),
            file_url: r.get("file_url"),
            original_filename: r.get("original_filename"),
            file_type: r.get("file_type"),
            file_size: r.get::<i64, _>("file_size") as u64,
        });

        let status = sqlx::query(
            r#"
            SELECT user_id, status, updated_at FROM message_status
            WHERE message_id = $1 ORDER BY user_id
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| StatusRow {
            user_id: r.get("user_id"),
            status: parse_delivery_state(r.get::<String, _>("status").as_str()),
            updated_at: r.get("updated_at"),
        })
        .collect();

        Ok(HydratedMessage {
            message_id,
            chat_id,
            sender: user_from_row(&row),
            chat: ChatSummary {
                chat_id,
                chat_name: row.get("chat_name"),
                chat_type: parse_chat_type(row.get::<String, _>("chat_type").as_str()),
                chat_image: row.get("chat_image"),
            },
            message_text: row.get("message_text"),
            message_type: parse_message_type(row.get::<String, _>("message_type").as_str()),
            created_at: row.get("created_at"),
            reply_to,
            attachment,
            status,
        })
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, username, full_name, profile_pic FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    async fn chats_for_user(&self, user_id: i64) -> Result<Vec<ChatSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.chat_id, c.chat_name, c.chat_type, c.chat_image
            FROM chats c
            JOIN chat_members cm ON cm.chat_id = c.chat_id
            WHERE cm.user_id = $1
            ORDER BY c.chat_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chat_from_row).collect())
    }

    async fn is_member(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM chat_members WHERE chat_id = $1 AND user_id = $2) AS present",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("present"))
    }

    async fn member_ids(&self, chat_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT user_id FROM chat_members WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }

    async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM chat_members WHERE chat_id = $1 AND user_id = $2 AND is_admin) AS admin",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("admin"))
    }

    async fn create_message(&self, new: NewMessage) -> Result<HydratedMessage, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO messages (chat_id, sender_id, message_text, message_type, reply_to_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING message_id
            "#,
        )
        .bind(new.chat_id)
        .bind(new.sender_id)
        .bind(&new.message_text)
        .bind(message_type_str(new.message_type))
        .bind(new.reply_to_id)
        .fetch_one(&mut *tx)
        .await?;
        let message_id: i64 = row.get("message_id");

        let member_rows = sqlx::query("SELECT user_id FROM chat_members WHERE chat_id = $1")
            .bind(new.chat_id)
            .fetch_all(&mut *tx)
            .await?;

        for member in &member_rows {
            let user_id: i64 = member.get("user_id");
            let status = if user_id == new.sender_id {
                DeliveryState::Sent
            } else {
                DeliveryState::Delivered
            };
            sqlx::query(
                "INSERT INTO message_status (message_id, user_id, status) VALUES ($1, $2, $3)",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(delivery_state_str(status))
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO message_visibility (message_id, user_id, is_visible) VALUES ($1, $2, TRUE)",
            )
            .bind(message_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(att) = &new.attachment {
            sqlx::query(
                r#"
                INSERT INTO attachments (message_id, file_url, original_filename, file_type, file_size)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(message_id)
            .bind(&att.file_url)
            .bind(&att.original_filename)
            .bind(&att.file_type)
            .bind(att.file_size as i64)
            .execute(&mut *tx)
            .await?;
        }

        // New activity restores a soft-deleted chat, never an archived one.
        sqlx::query(
            r#"
            UPDATE chat_visibility SET is_visible = TRUE, hidden_at = NULL
            WHERE chat_id = $1 AND is_visible = FALSE AND is_archived = FALSE
            "#,
        )
        .bind(new.chat_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.hydrate(message_id).await
    }

    async fn message_brief(&self, message_id: i64) -> Result<Option<MessageBrief>, StoreError> {
        let row = sqlx::query(
            "SELECT message_id, chat_id, sender_id FROM messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MessageBrief {
            message_id: r.get("message_id"),
            chat_id: r.get("chat_id"),
            sender_id: r.get("sender_id"),
        }))
    }

    async fn delivery_status(
        &self,
        message_id: i64,
        user_id: i64,
    ) -> Result<Option<StatusRow>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, status, updated_at FROM message_status WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StatusRow {
            user_id: r.get("user_id"),
            status: parse_delivery_state(r.get::<String, _>("status").as_str()),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn set_delivery_status(
        &self,
        message_id: i64,
        user_id: i64,
        status: DeliveryState,
    ) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE message_status SET status = $3, updated_at = NOW()
            WHERE message_id = $1 AND user_id = $2
            RETURNING updated_at
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(delivery_state_str(status))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("message status"))?;
        Ok(row.get("updated_at"))
    }

    async fn hide_for_user(&self, message_id: i64, user_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE message_visibility
            SET is_visible = FALSE, hidden_at = COALESCE(hidden_at, NOW())
            WHERE message_id = $1 AND user_id = $2
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("message visibility"));
        }
        Ok(())
    }

    async fn visible_count(&self, message_id: i64) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS visible FROM message_visibility WHERE message_id = $1 AND is_visible",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("visible") as u64)
    }

    async fn attachment_urls(&self, message_id: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT file_url FROM attachments WHERE message_id = $1")
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("file_url")).collect())
    }

    async fn delete_message_cascade(&self, message_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM message_visibility WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM message_status WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM attachments WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("message"));
        }
        Ok(())
    }

    async fn set_online(&self, user_id: i64, online: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_online = $2, last_seen = NOW() WHERE user_id = $1")
            .bind(user_id)
            .bind(online)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_status_message(
        &self,
        user_id: i64,
        status_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET status_message = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(status_message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
