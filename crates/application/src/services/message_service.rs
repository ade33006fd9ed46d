//! 消息服务
//!
//! 发送：校验 → 成员检查 → 持久化 → 扇出。修改、删除和已读回执同样
//! 先写存储再扇出。扇出在共享的 `TaskTracker` 后台任务中执行：调用方等待
//! 它完成，但调用方被取消（例如 HTTP 请求中断）时已持久化的变更仍会送达。
//! 扇出失败不影响已持久化的数据，只记录日志。

use std::sync::Arc;

use domain::{
    ConversationId, ConversationRepository, MessageContent, MessageDeletion, MessageEdit,
    MessageEnvelope, MessageId, MessageRepository, MessageSummary, NewMessage, Timestamp, UserId,
};
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    dispatcher::{run_detached, MessageDispatcher},
    error::ApplicationError,
};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct EditMessageRequest {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub content: MessageContent,
}

#[derive(Debug, Clone)]
pub struct DeleteMessageRequest {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub for_everyone: bool,
}

/// 一次标记已读的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeenReceipt {
    /// 读到的最后一条消息
    pub message_id: MessageId,
    /// 读者本次的已读时间
    pub seen_at: Timestamp,
    /// 新增的回执数
    pub newly_seen: usize,
}

pub struct MessageServiceDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub clock: Arc<dyn Clock>,
    pub tasks: TaskTracker,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn send(&self, request: SendMessageRequest) -> Result<MessageSummary, ApplicationError> {
        request.content.validate()?;
        self.ensure_member(request.conversation_id, request.author_id)
            .await?;

        let summary = self
            .deps
            .messages
            .persist_message(NewMessage {
                envelope: MessageEnvelope {
                    author_id: request.author_id,
                    conversation_id: request.conversation_id,
                    reply_to: request.reply_to,
                },
                content: request.content,
                created_at: self.deps.clock.now(),
            })
            .await?;

        info!(
            message_id = %summary.id,
            conversation_id = %request.conversation_id,
            author_id = %request.author_id,
            kind = summary.content.kind(),
            "消息已保存"
        );

        let dispatcher = Arc::clone(&self.deps.dispatcher);
        let message = summary.clone();
        let conversation_id = request.conversation_id;
        let dispatched = run_detached(&self.deps.tasks, async move {
            dispatcher.dispatch_message(&message, conversation_id).await
        })
        .await;
        if let Err(err) = dispatched {
            warn!(message_id = %summary.id, error = %err, "消息已保存但扇出失败");
        }

        Ok(summary)
    }

    /// 修改自己发送的消息并推送给会话成员
    pub async fn edit(&self, request: EditMessageRequest) -> Result<MessageSummary, ApplicationError> {
        request.content.validate()?;
        self.ensure_member(request.conversation_id, request.author_id)
            .await?;

        let summary = self
            .deps
            .messages
            .edit_message(MessageEdit {
                conversation_id: request.conversation_id,
                message_id: request.message_id,
                author_id: request.author_id,
                content: request.content,
                edited_at: self.deps.clock.now(),
            })
            .await?
            .ok_or(ApplicationError::MessageNotFound(request.message_id))?;

        info!(message_id = %summary.id, author_id = %request.author_id, "消息已修改");

        let dispatcher = Arc::clone(&self.deps.dispatcher);
        let message = summary.clone();
        let dispatched = run_detached(&self.deps.tasks, async move {
            dispatcher.dispatch_edit(&message).await
        })
        .await;
        if let Err(err) = dispatched {
            warn!(message_id = %summary.id, error = %err, "消息已修改但扇出失败");
        }

        Ok(summary)
    }

    /// 删除自己发送的消息；`for_everyone` 为 false 时只对作者本人隐藏
    pub async fn delete(&self, request: DeleteMessageRequest) -> Result<(), ApplicationError> {
        let DeleteMessageRequest {
            conversation_id,
            message_id,
            author_id,
            for_everyone,
        } = request;
        self.ensure_member(conversation_id, author_id).await?;

        let deleted = self
            .deps
            .messages
            .delete_message(MessageDeletion {
                conversation_id,
                message_id,
                author_id,
                for_everyone,
                deleted_at: self.deps.clock.now(),
            })
            .await?;
        if !deleted {
            return Err(ApplicationError::MessageNotFound(message_id));
        }

        info!(message_id = %message_id, author_id = %author_id, for_everyone, "消息已删除");

        let dispatcher = Arc::clone(&self.deps.dispatcher);
        let dispatched = run_detached(&self.deps.tasks, async move {
            dispatcher
                .dispatch_deletion(conversation_id, message_id, author_id, for_everyone)
                .await
        })
        .await;
        if let Err(err) = dispatched {
            warn!(message_id = %message_id, error = %err, "消息已删除但扇出失败");
        }

        Ok(())
    }

    /// 标记 `message_id` 及其之前的消息为已读
    ///
    /// 有新增回执时把读者自己的已读时间推送给会话其他成员。
    pub async fn mark_seen(
        &self,
        reader_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<SeenReceipt, ApplicationError> {
        self.ensure_member(conversation_id, reader_id).await?;

        let seen_at = self.deps.clock.now();
        let newly_seen = self
            .deps
            .messages
            .mark_seen(conversation_id, reader_id, message_id, seen_at)
            .await?
            .ok_or(ApplicationError::MessageNotFound(message_id))?;

        if newly_seen > 0 {
            let dispatcher = Arc::clone(&self.deps.dispatcher);
            let dispatched = run_detached(&self.deps.tasks, async move {
                dispatcher
                    .dispatch_ack(conversation_id, reader_id, message_id, seen_at)
                    .await
            })
            .await;
            if let Err(err) = dispatched {
                warn!(message_id = %message_id, error = %err, "已读回执扇出失败");
            }
        }

        Ok(SeenReceipt {
            message_id,
            seen_at,
            newly_seen,
        })
    }

    /// 会话存在且用户为有效成员
    pub async fn ensure_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        if self
            .deps
            .conversations
            .find_conversation(conversation_id)
            .await?
            .is_none()
        {
            return Err(ApplicationError::ConversationNotFound(conversation_id));
        }

        if !self
            .deps
            .conversations
            .is_active_member(conversation_id, user_id)
            .await?
        {
            return Err(ApplicationError::NotAMember {
                conversation_id,
                user_id,
            });
        }
        Ok(())
    }
}
