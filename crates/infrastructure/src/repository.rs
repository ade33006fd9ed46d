use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Conversation, ConversationId, ConversationKind, ConversationMember, ConversationRepository,
    MessageContent, MessageDeletion, MessageEdit, MessageEnvelope, MessageId, MessageRepository,
    MessageSummary, NewMessage, RepositoryError, RepositoryResult, ReplyPreview, Timestamp,
    UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            RepositoryError::Conflict
        }
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    kind: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        let kind = match (value.kind.as_str(), value.name) {
            ("private", _) => ConversationKind::Private,
            ("group", Some(name)) => ConversationKind::Group { name },
            (other, _) => {
                return Err(invalid_data(format!("invalid conversation kind: {other}")));
            }
        };
        Ok(Conversation {
            id: ConversationId::from(value.id),
            kind,
            created_at: value.created_at,
        })
    }
}

/// 消息内容在表中的列表示
struct ContentColumns<'a> {
    kind: &'static str,
    body: Option<&'a str>,
    media_url: Option<&'a str>,
    caption: Option<&'a str>,
}

impl<'a> From<&'a MessageContent> for ContentColumns<'a> {
    fn from(content: &'a MessageContent) -> Self {
        match content {
            MessageContent::Text { text } => ContentColumns {
                kind: "text",
                body: Some(text),
                media_url: None,
                caption: None,
            },
            MessageContent::Photo { image_url, caption } => ContentColumns {
                kind: "photo",
                body: None,
                media_url: Some(image_url),
                caption: caption.as_deref(),
            },
            MessageContent::Video { video_url, caption } => ContentColumns {
                kind: "video",
                body: None,
                media_url: Some(video_url),
                caption: caption.as_deref(),
            },
        }
    }
}

fn content_from_columns(
    kind: &str,
    body: Option<String>,
    media_url: Option<String>,
    caption: Option<String>,
) -> Result<MessageContent, RepositoryError> {
    match (kind, body, media_url) {
        ("text", Some(text), _) => Ok(MessageContent::Text { text }),
        ("photo", _, Some(image_url)) => Ok(MessageContent::Photo { image_url, caption }),
        ("video", _, Some(video_url)) => Ok(MessageContent::Video { video_url, caption }),
        (other, _, _) => Err(invalid_data(format!("invalid message row of kind {other}"))),
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    author_id: Uuid,
    kind: String,
    body: Option<String>,
    media_url: Option<String>,
    caption: Option<String>,
    reply_to: Option<Uuid>,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    seen_by: Vec<Uuid>,
}

impl MessageRecord {
    fn into_summary(self, reply_preview: Option<ReplyPreview>) -> Result<MessageSummary, RepositoryError> {
        let content = content_from_columns(&self.kind, self.body, self.media_url, self.caption)?;
        Ok(MessageSummary {
            id: MessageId::from(self.id),
            envelope: MessageEnvelope {
                author_id: UserId::from(self.author_id),
                conversation_id: ConversationId::from(self.conversation_id),
                reply_to: self.reply_to.map(MessageId::from),
            },
            content,
            reply_preview,
            created_at: self.created_at,
            edited_at: self.edited_at,
            seen_by: self.seen_by.into_iter().map(UserId::from).collect(),
        })
    }
}

const MESSAGE_COLUMNS: &str = r#"id, conversation_id, author_id, kind, body, media_url, caption, reply_to, created_at, edited_at,
    ARRAY(SELECT r.user_id FROM message_receipts r WHERE r.message_id = messages.id ORDER BY r.seen_at, r.user_id) AS seen_by"#;

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> RepositoryResult<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"SELECT id, kind, name, created_at FROM conversations WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn active_members(&self, id: ConversationId) -> RepositoryResult<Vec<UserId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id FROM conversation_members
            WHERE conversation_id = $1 AND left_at IS NULL
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(ids.into_iter().map(UserId::from).collect())
    }

    async fn conversations_of(&self, user_id: UserId) -> RepositoryResult<Vec<ConversationId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT conversation_id FROM conversation_members
            WHERE user_id = $1 AND left_at IS NULL
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(ids.into_iter().map(ConversationId::from).collect())
    }

    async fn is_active_member(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> RepositoryResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM conversation_members
                WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
            )
            "#,
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn find_private_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT c.id, c.kind, c.name, c.created_at
            FROM conversations c
            JOIN conversation_members ma ON ma.conversation_id = c.id AND ma.user_id = $1
            JOIN conversation_members mb ON mb.conversation_id = c.id AND mb.user_id = $2
            WHERE c.kind = 'private'
            ORDER BY c.created_at
            LIMIT 1
            "#,
        )
        .bind(Uuid::from(a))
        .bind(Uuid::from(b))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: Vec<ConversationMember>,
    ) -> RepositoryResult<Conversation> {
        let (kind, name) = match &conversation.kind {
            ConversationKind::Private => ("private", None),
            ConversationKind::Group { name } => ("group", Some(name.as_str())),
        };

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        sqlx::query(
            r#"INSERT INTO conversations (id, kind, name, created_at) VALUES ($1, $2, $3, $4)"#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(kind)
        .bind(name)
        .bind(conversation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        for member in &members {
            sqlx::query(
                r#"
                INSERT INTO conversation_members (conversation_id, user_id, joined_at, left_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::from(member.conversation_id))
            .bind(Uuid::from(member.user_id))
            .bind(member.joined_at)
            .bind(member.left_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(conversation)
    }

    async fn remove_member(
        &self,
        id: ConversationId,
        user_id: UserId,
        left_at: Timestamp,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversation_members SET left_at = $3
            WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
            "#,
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(user_id))
        .bind(left_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn restore_member(&self, id: ConversationId, user_id: UserId) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversation_members SET left_at = NULL
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(user_id))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 同一会话内被回复消息的预览
    async fn reply_preview(
        &self,
        conversation_id: ConversationId,
        reply_to: MessageId,
    ) -> RepositoryResult<Option<ReplyPreview>> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 AND conversation_id = $2 AND deleted_at IS NULL"
        ))
        .bind(Uuid::from(reply_to))
        .bind(Uuid::from(conversation_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record
            .map(|record| {
                let original = record.into_summary(None)?;
                Ok(ReplyPreview {
                    message_id: original.id,
                    preview: original.preview(),
                })
            })
            .transpose()
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn persist_message(&self, message: NewMessage) -> RepositoryResult<MessageSummary> {
        let envelope = &message.envelope;
        let reply_preview = match envelope.reply_to {
            Some(reply_to) => self.reply_preview(envelope.conversation_id, reply_to).await?,
            None => None,
        };
        // 被回复的消息不在该会话中时不保留引用
        let reply_to = reply_preview.as_ref().map(|preview| preview.message_id);
        let columns = ContentColumns::from(&message.content);

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages (id, conversation_id, author_id, kind, body, media_url, caption, reply_to, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(Uuid::from(envelope.conversation_id))
        .bind(Uuid::from(envelope.author_id))
        .bind(columns.kind)
        .bind(columns.body)
        .bind(columns.media_url)
        .bind(columns.caption)
        .bind(reply_to.map(Uuid::from))
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.into_summary(reply_preview)
    }

    async fn mark_seen(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
        seen_at: Timestamp,
    ) -> RepositoryResult<Option<usize>> {
        let (found, newly_seen) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            WITH target AS (
                SELECT seq FROM messages WHERE id = $1 AND conversation_id = $2
            ), inserted AS (
                INSERT INTO message_receipts (message_id, user_id, seen_at)
                SELECT m.id, $3, $4
                FROM messages m, target t
                WHERE m.conversation_id = $2
                  AND m.seq <= t.seq
                  AND m.author_id <> $3
                  AND m.deleted_at IS NULL
                ON CONFLICT (message_id, user_id) DO NOTHING
                RETURNING 1
            )
            SELECT (SELECT COUNT(*) FROM target), (SELECT COUNT(*) FROM inserted)
            "#,
        )
        .bind(Uuid::from(up_to))
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(reader_id))
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if found == 0 {
            return Ok(None);
        }
        Ok(Some(usize::try_from(newly_seen).unwrap_or_default()))
    }

    async fn edit_message(&self, edit: MessageEdit) -> RepositoryResult<Option<MessageSummary>> {
        let columns = ContentColumns::from(&edit.content);
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET kind = $4, body = $5, media_url = $6, caption = $7, edited_at = $8
            WHERE id = $1 AND conversation_id = $2 AND author_id = $3
              AND deleted_at IS NULL AND NOT hidden_for_author
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(edit.message_id))
        .bind(Uuid::from(edit.conversation_id))
        .bind(Uuid::from(edit.author_id))
        .bind(columns.kind)
        .bind(columns.body)
        .bind(columns.media_url)
        .bind(columns.caption)
        .bind(edit.edited_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let Some(record) = record else {
            return Ok(None);
        };
        let reply_preview = match record.reply_to {
            Some(reply_to) => {
                self.reply_preview(edit.conversation_id, MessageId::from(reply_to))
                    .await?
            }
            None => None,
        };
        record.into_summary(reply_preview).map(Some)
    }

    async fn delete_message(&self, deletion: MessageDeletion) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET deleted_at = CASE WHEN $4 THEN $5 ELSE deleted_at END,
                hidden_for_author = hidden_for_author OR NOT $4
            WHERE id = $1 AND conversation_id = $2 AND author_id = $3
              AND deleted_at IS NULL AND NOT hidden_for_author
            "#,
        )
        .bind(Uuid::from(deletion.message_id))
        .bind(Uuid::from(deletion.conversation_id))
        .bind(Uuid::from(deletion.author_id))
        .bind(deletion.for_everyone)
        .bind(deletion.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }
}

/// 全部 PostgreSQL 仓储
#[derive(Clone)]
pub struct PgStorage {
    pub conversation_repository: Arc<PgConversationRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversation_repository: Arc::new(PgConversationRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_columns_round_trip_media() {
        let content = MessageContent::Photo {
            image_url: "https://cdn.example.com/a.png".to_string(),
            caption: Some("sunset".to_string()),
        };
        let columns = ContentColumns::from(&content);
        assert_eq!(columns.kind, "photo");
        assert!(columns.body.is_none());

        let restored = content_from_columns(
            columns.kind,
            columns.body.map(str::to_string),
            columns.media_url.map(str::to_string),
            columns.caption.map(str::to_string),
        )
        .unwrap();
        assert_eq!(restored, content);
    }

    #[test]
    fn rejects_inconsistent_rows() {
        assert!(content_from_columns("text", None, None, None).is_err());
        assert!(content_from_columns("audio", Some("x".into()), None, None).is_err());

        let record = ConversationRecord {
            id: Uuid::new_v4(),
            kind: "group".to_string(),
            name: None,
            created_at: Utc::now(),
        };
        assert!(Conversation::try_from(record).is_err());
    }
}
