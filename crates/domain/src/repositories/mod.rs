//! Repository接口定义
//!
//! 实时核心通过这些接口访问外部数据存储（会话、成员关系、消息）。
//! 内层定义接口，外层（infrastructure）实现接口。

use async_trait::async_trait;

use crate::entities::{
    Conversation, ConversationMember, MessageDeletion, MessageEdit, MessageSummary, NewMessage,
};
use crate::errors::RepositoryResult;
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 会话与成员关系仓储
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// 按ID查找会话
    async fn find_conversation(&self, id: ConversationId)
        -> RepositoryResult<Option<Conversation>>;

    /// 会话的有效成员（排除软删除的成员关系）
    async fn active_members(&self, id: ConversationId) -> RepositoryResult<Vec<UserId>>;

    /// 用户仍有有效成员关系的全部会话
    async fn conversations_of(&self, user_id: UserId) -> RepositoryResult<Vec<ConversationId>>;

    /// 用户是否为会话的有效成员
    async fn is_active_member(&self, id: ConversationId, user_id: UserId)
        -> RepositoryResult<bool>;

    /// 查找两个用户之间的私聊，不论双方的成员关系是否已失效
    async fn find_private_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<Option<Conversation>>;

    /// 在一次写入中创建会话及其成员关系
    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: Vec<ConversationMember>,
    ) -> RepositoryResult<Conversation>;

    /// 软删除成员关系；成员关系不存在或已失效时返回 false
    async fn remove_member(
        &self,
        id: ConversationId,
        user_id: UserId,
        left_at: Timestamp,
    ) -> RepositoryResult<bool>;

    /// 恢复已失效的成员关系；成员关系不存在时返回 false
    async fn restore_member(&self, id: ConversationId, user_id: UserId) -> RepositoryResult<bool>;
}

/// 消息仓储
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 持久化消息，返回带ID和回复预览的摘要
    async fn persist_message(&self, message: NewMessage) -> RepositoryResult<MessageSummary>;

    /// 记录读者对 `up_to` 及其之前全部消息的已读回执
    ///
    /// 读者自己发送的消息、已删除的消息和已有回执的消息不记录。
    /// 返回新增的回执数；`up_to` 不在该会话中时返回 None。
    async fn mark_seen(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
        seen_at: Timestamp,
    ) -> RepositoryResult<Option<usize>>;

    /// 修改消息内容；消息不存在、已删除或不属于该作者时返回 None
    async fn edit_message(&self, edit: MessageEdit) -> RepositoryResult<Option<MessageSummary>>;

    /// 删除消息；消息不存在、已删除或不属于该作者时返回 false
    async fn delete_message(&self, deletion: MessageDeletion) -> RepositoryResult<bool>;
}
