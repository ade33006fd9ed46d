//! 内存适配器
//!
//! 用于测试和单进程演示：会话/消息仓储、静态 token 认证、基于通道的传输。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use domain::{
    CloseCode, Conversation, ConversationId, ConversationKind, ConversationMember,
    ConversationRepository, MessageDeletion, MessageEdit, MessageEnvelope, MessageId,
    MessageRepository, MessageSummary, NewMessage, RepositoryError, RepositoryResult,
    ReplyPreview, ServerFrame, Timestamp, UserId,
};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::{AuthFailure, Authenticator, Credential};
use crate::transport::{FrameSink, FrameSource, Inbound, Transport, TransportError};

#[derive(Debug, Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    members: RwLock<HashMap<ConversationId, Vec<ConversationMember>>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入一个群聊，返回会话ID
    pub async fn insert_group(&self, name: &str, members: &[UserId]) -> ConversationId {
        let id = ConversationId::from(Uuid::new_v4());
        let now = Utc::now();
        let conversation = Conversation {
            id,
            kind: ConversationKind::Group {
                name: name.to_string(),
            },
            created_at: now,
        };
        let members = members
            .iter()
            .map(|user_id| ConversationMember::new(id, *user_id, now))
            .collect();
        self.conversations.write().await.insert(id, conversation);
        self.members.write().await.insert(id, members);
        id
    }

    /// 删除会话及其成员关系
    pub async fn delete(&self, id: ConversationId) {
        self.conversations.write().await.remove(&id);
        self.members.write().await.remove(&id);
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> RepositoryResult<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn active_members(&self, id: ConversationId) -> RepositoryResult<Vec<UserId>> {
        let members = self.members.read().await;
        let list = members.get(&id).ok_or(RepositoryError::NotFound)?;
        Ok(list
            .iter()
            .filter(|member| member.is_active())
            .map(|member| member.user_id)
            .collect())
    }

    async fn conversations_of(&self, user_id: UserId) -> RepositoryResult<Vec<ConversationId>> {
        let members = self.members.read().await;
        Ok(members
            .iter()
            .filter(|(_, list)| {
                list.iter()
                    .any(|member| member.user_id == user_id && member.is_active())
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn is_active_member(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> RepositoryResult<bool> {
        let members = self.members.read().await;
        Ok(members
            .get(&id)
            .map(|list| {
                list.iter()
                    .any(|member| member.user_id == user_id && member.is_active())
            })
            .unwrap_or(false))
    }

    async fn find_private_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<Option<Conversation>> {
        let conversations = self.conversations.read().await;
        let members = self.members.read().await;
        Ok(conversations
            .values()
            .filter(|conversation| !conversation.is_group())
            .find(|conversation| {
                members
                    .get(&conversation.id)
                    .map(|list| {
                        let joined =
                            |user: UserId| list.iter().any(|member| member.user_id == user);
                        joined(a) && joined(b)
                    })
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: Vec<ConversationMember>,
    ) -> RepositoryResult<Conversation> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict);
        }
        conversations.insert(conversation.id, conversation.clone());
        self.members
            .write()
            .await
            .insert(conversation.id, members);
        Ok(conversation)
    }

    async fn remove_member(
        &self,
        id: ConversationId,
        user_id: UserId,
        left_at: Timestamp,
    ) -> RepositoryResult<bool> {
        let mut members = self.members.write().await;
        let Some(list) = members.get_mut(&id) else {
            return Ok(false);
        };
        match list
            .iter_mut()
            .find(|member| member.user_id == user_id && member.is_active())
        {
            Some(member) => {
                member.left_at = Some(left_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn restore_member(&self, id: ConversationId, user_id: UserId) -> RepositoryResult<bool> {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(&id)
            .and_then(|list| list.iter_mut().find(|member| member.user_id == user_id));
        Ok(match member {
            Some(member) => {
                member.left_at = None;
                true
            }
            None => false,
        })
    }
}

#[derive(Debug)]
struct StoredMessage {
    summary: MessageSummary,
    /// 写入顺序，已读回执按它划定范围
    sequence: u64,
    deleted_for_everyone: bool,
    hidden_for_author: bool,
}

impl StoredMessage {
    fn is_deleted(&self) -> bool {
        self.deleted_for_everyone || self.hidden_for_author
    }
}

#[derive(Debug, Default)]
struct MessageLog {
    messages: HashMap<MessageId, StoredMessage>,
    next_sequence: u64,
}

impl MessageLog {
    /// 作者本人仍可见的消息
    fn authored_mut(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        author_id: UserId,
    ) -> Option<&mut StoredMessage> {
        self.messages.get_mut(&message_id).filter(|stored| {
            stored.summary.conversation_id() == conversation_id
                && stored.summary.author_id() == author_id
                && !stored.is_deleted()
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMessageRepository {
    log: RwLock<MessageLog>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未被删除的消息
    pub async fn get(&self, id: MessageId) -> Option<MessageSummary> {
        self.log
            .read()
            .await
            .messages
            .get(&id)
            .filter(|stored| !stored.deleted_for_everyone)
            .map(|stored| stored.summary.clone())
    }

    pub async fn count(&self) -> usize {
        self.log.read().await.messages.len()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn persist_message(&self, message: NewMessage) -> RepositoryResult<MessageSummary> {
        let mut log = self.log.write().await;
        let reply_preview = message
            .envelope
            .reply_to
            .and_then(|reply_to| log.messages.get(&reply_to))
            .filter(|original| {
                original.summary.conversation_id() == message.envelope.conversation_id
                    && !original.deleted_for_everyone
            })
            .map(|original| ReplyPreview {
                message_id: original.summary.id,
                preview: original.summary.preview(),
            });

        let summary = MessageSummary {
            id: MessageId::from(Uuid::new_v4()),
            // 被回复的消息不在该会话中时不保留引用
            envelope: MessageEnvelope {
                reply_to: reply_preview.as_ref().map(|preview| preview.message_id),
                ..message.envelope
            },
            content: message.content,
            reply_preview,
            created_at: message.created_at,
            edited_at: None,
            seen_by: Vec::new(),
        };
        let sequence = log.next_sequence;
        log.next_sequence += 1;
        log.messages.insert(
            summary.id,
            StoredMessage {
                summary: summary.clone(),
                sequence,
                deleted_for_everyone: false,
                hidden_for_author: false,
            },
        );
        Ok(summary)
    }

    async fn mark_seen(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
        _seen_at: Timestamp,
    ) -> RepositoryResult<Option<usize>> {
        let mut log = self.log.write().await;
        let Some(cutoff) = log
            .messages
            .get(&up_to)
            .filter(|stored| stored.summary.conversation_id() == conversation_id)
            .map(|stored| stored.sequence)
        else {
            return Ok(None);
        };

        let mut newly_seen = 0;
        for stored in log.messages.values_mut() {
            let summary = &mut stored.summary;
            if summary.conversation_id() != conversation_id
                || stored.sequence > cutoff
                || stored.deleted_for_everyone
                || summary.author_id() == reader_id
                || summary.is_seen_by(reader_id)
            {
                continue;
            }
            summary.seen_by.push(reader_id);
            newly_seen += 1;
        }
        Ok(Some(newly_seen))
    }

    async fn edit_message(&self, edit: MessageEdit) -> RepositoryResult<Option<MessageSummary>> {
        let mut log = self.log.write().await;
        Ok(log
            .authored_mut(edit.conversation_id, edit.message_id, edit.author_id)
            .map(|stored| {
                stored.summary.content = edit.content;
                stored.summary.edited_at = Some(edit.edited_at);
                stored.summary.clone()
            }))
    }

    async fn delete_message(&self, deletion: MessageDeletion) -> RepositoryResult<bool> {
        let mut log = self.log.write().await;
        let Some(stored) =
            log.authored_mut(deletion.conversation_id, deletion.message_id, deletion.author_id)
        else {
            return Ok(false);
        };
        if deletion.for_everyone {
            stored.deleted_for_everyone = true;
        } else {
            stored.hidden_for_author = true;
        }
        Ok(true)
    }
}

/// 固定 token → 用户 映射的认证器
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> Result<UserId, AuthFailure> {
        if credential.is_empty() {
            return Err(AuthFailure::MissingCredential);
        }
        self.tokens
            .get(credential.as_str())
            .copied()
            .ok_or(AuthFailure::InvalidCredential)
    }
}

/// 客户端一侧观察到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Frame(ServerFrame),
    Closed(CloseCode),
}

/// 基于通道的内存传输
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelTransport {
    /// 创建服务端传输与对应的客户端句柄
    pub fn pair() -> (ChannelTransport, ChannelClient) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            ChannelClient {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
            },
        )
    }
}

pub struct ChannelSink {
    outbound: mpsc::UnboundedSender<ClientEvent>,
}

pub struct ChannelSource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Transport for ChannelTransport {
    type Sink = ChannelSink;
    type Source = ChannelSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (
            ChannelSink {
                outbound: self.outbound,
            },
            ChannelSource {
                inbound: self.inbound,
            },
        )
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        self.outbound
            .send(ClientEvent::Frame(frame.clone()))
            .map_err(|_| TransportError::ConnectionGone)
    }

    async fn close(&mut self, code: CloseCode, _reason: &str) {
        let _ = self.outbound.send(ClientEvent::Closed(code));
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn receive(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }
}

/// 内存传输的客户端句柄
pub struct ChannelClient {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ChannelClient {
    /// 发送一帧原始文本；连接已关闭时返回 false
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Inbound::Text(text.into()))
    }

    pub fn send_json(&self, value: &impl serde::Serialize) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    pub fn heartbeat(&self) -> bool {
        self.send(Inbound::Heartbeat)
    }

    pub fn send(&self, inbound: Inbound) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(inbound).is_ok())
            .unwrap_or(false)
    }

    /// 模拟客户端断开
    pub fn disconnect(&mut self) {
        self.inbound.take();
    }

    pub async fn next_event(&mut self, wait: Duration) -> Option<ClientEvent> {
        tokio::time::timeout(wait, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// 下一帧服务端推送；遇到关闭或超时返回 `None`
    pub async fn next_frame(&mut self, wait: Duration) -> Option<ServerFrame> {
        match self.next_event(wait).await? {
            ClientEvent::Frame(frame) => Some(frame),
            ClientEvent::Closed(_) => None,
        }
    }

    /// 跳过推送帧直到收到关闭
    pub async fn closed(&mut self, wait: Duration) -> Option<CloseCode> {
        loop {
            match self.next_event(wait).await? {
                ClientEvent::Closed(code) => return Some(code),
                ClientEvent::Frame(_) => continue,
            }
        }
    }

    /// 立即取出一个已到达的事件
    pub fn try_event(&mut self) -> Option<ClientEvent> {
        self.outbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{MessageContent, MessageEnvelope};

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[tokio::test]
    async fn membership_queries_respect_soft_delete() {
        let repo = InMemoryConversationRepository::new();
        let (alice, bob) = (user(), user());
        let id = repo.insert_group("team", &[alice, bob]).await;

        assert!(repo.remove_member(id, bob, Utc::now()).await.unwrap());
        assert!(!repo.remove_member(id, bob, Utc::now()).await.unwrap());
        assert_eq!(repo.active_members(id).await.unwrap(), vec![alice]);
        assert!(repo.conversations_of(bob).await.unwrap().is_empty());
        assert!(!repo.is_active_member(id, bob).await.unwrap());
    }

    #[tokio::test]
    async fn private_chat_is_found_after_a_member_left() {
        let repo = InMemoryConversationRepository::new();
        let (alice, bob) = (user(), user());
        let conversation = Conversation::private(ConversationId::from(Uuid::new_v4()), Utc::now());
        let members = vec![
            ConversationMember::new(conversation.id, alice, Utc::now()),
            ConversationMember::new(conversation.id, bob, Utc::now()),
        ];
        let id = repo.create_conversation(conversation, members).await.unwrap().id;

        repo.remove_member(id, bob, Utc::now()).await.unwrap();
        let found = repo.find_private_between(alice, bob).await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(id));

        assert!(repo.restore_member(id, bob).await.unwrap());
        assert!(repo.is_active_member(id, bob).await.unwrap());
        assert!(!repo.restore_member(id, user()).await.unwrap());
    }

    fn text(envelope: &MessageEnvelope, body: &str) -> NewMessage {
        NewMessage {
            envelope: envelope.clone(),
            content: MessageContent::text(body),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reply_preview_stays_inside_the_conversation() {
        let repo = InMemoryMessageRepository::new();
        let envelope = MessageEnvelope {
            author_id: user(),
            conversation_id: ConversationId::from(Uuid::new_v4()),
            reply_to: None,
        };
        let original = repo.persist_message(text(&envelope, "original")).await.unwrap();
        let reply = repo
            .persist_message(text(
                &MessageEnvelope {
                    reply_to: Some(original.id),
                    ..envelope.clone()
                },
                "reply",
            ))
            .await
            .unwrap();
        assert_eq!(reply.reply_preview.unwrap().message_id, original.id);
        assert_eq!(reply.envelope.reply_to, Some(original.id));

        let foreign = repo
            .persist_message(text(
                &MessageEnvelope {
                    conversation_id: ConversationId::from(Uuid::new_v4()),
                    reply_to: Some(original.id),
                    ..envelope
                },
                "elsewhere",
            ))
            .await
            .unwrap();
        assert!(foreign.reply_preview.is_none());
        assert_eq!(foreign.envelope.reply_to, None);
    }

    #[tokio::test]
    async fn receipts_are_per_reader_and_cover_earlier_messages() {
        let repo = InMemoryMessageRepository::new();
        let (alice, bob, carol) = (user(), user(), user());
        let conversation_id = ConversationId::from(Uuid::new_v4());
        let from = |author_id| MessageEnvelope {
            author_id,
            conversation_id,
            reply_to: None,
        };
        let first = repo.persist_message(text(&from(alice), "one")).await.unwrap();
        let own = repo.persist_message(text(&from(bob), "two")).await.unwrap();
        let third = repo.persist_message(text(&from(alice), "three")).await.unwrap();
        let later = repo.persist_message(text(&from(alice), "four")).await.unwrap();

        // bob 读到第三条：第一、三条记录回执，自己的消息和之后的消息不记录
        let newly = repo
            .mark_seen(conversation_id, bob, third.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(newly, Some(2));
        assert_eq!(repo.get(first.id).await.unwrap().seen_by, vec![bob]);
        assert!(repo.get(own.id).await.unwrap().seen_by.is_empty());
        assert!(repo.get(later.id).await.unwrap().seen_by.is_empty());

        // 重复标记不产生新回执，其他读者互不影响
        let again = repo
            .mark_seen(conversation_id, bob, third.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(again, Some(0));
        repo.mark_seen(conversation_id, carol, first.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(repo.get(first.id).await.unwrap().seen_by, vec![bob, carol]);

        // 作者标记自己的消息不记录回执
        let author = repo
            .mark_seen(conversation_id, alice, first.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(author, Some(0));

        let elsewhere = repo
            .mark_seen(ConversationId::from(Uuid::new_v4()), bob, first.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(elsewhere, None);
    }

    #[tokio::test]
    async fn only_the_author_edits_or_deletes() {
        let repo = InMemoryMessageRepository::new();
        let (alice, bob) = (user(), user());
        let conversation_id = ConversationId::from(Uuid::new_v4());
        let envelope = MessageEnvelope {
            author_id: alice,
            conversation_id,
            reply_to: None,
        };
        let message = repo.persist_message(text(&envelope, "draft")).await.unwrap();
        let edit = |author_id| MessageEdit {
            conversation_id,
            message_id: message.id,
            author_id,
            content: MessageContent::text("final"),
            edited_at: Utc::now(),
        };

        assert_eq!(repo.edit_message(edit(bob)).await.unwrap(), None);
        let edited = repo.edit_message(edit(alice)).await.unwrap().unwrap();
        assert_eq!(edited.content, MessageContent::text("final"));
        assert!(edited.edited_at.is_some());

        let deletion = |author_id, for_everyone| MessageDeletion {
            conversation_id,
            message_id: message.id,
            author_id,
            for_everyone,
            deleted_at: Utc::now(),
        };
        assert!(!repo.delete_message(deletion(bob, true)).await.unwrap());
        assert!(repo.delete_message(deletion(alice, true)).await.unwrap());
        assert!(repo.get(message.id).await.is_none());
        assert!(!repo.delete_message(deletion(alice, true)).await.unwrap());
        assert_eq!(repo.edit_message(edit(alice)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn static_tokens() {
        let alice = user();
        let auth = StaticTokenAuthenticator::new().with_token("alice-token", alice);
        assert_eq!(
            auth.authenticate(&Credential::new("alice-token")).await,
            Ok(alice)
        );
        assert_eq!(
            auth.authenticate(&Credential::new("nope")).await,
            Err(AuthFailure::InvalidCredential)
        );
        assert_eq!(
            auth.authenticate(&Credential::new("")).await,
            Err(AuthFailure::MissingCredential)
        );
    }
}
