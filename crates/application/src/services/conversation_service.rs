//! 会话管理：私聊、群聊、退出
//!
//! 成员关系变化只写存储；下一次扇出会重新解析成员，无需通知实时核心。

use std::collections::BTreeSet;
use std::sync::Arc;

use domain::{
    Conversation, ConversationId, ConversationMember, ConversationRepository, DomainError, UserId,
};
use tracing::info;
use uuid::Uuid;

use crate::{clock::Clock, error::ApplicationError};

#[derive(Debug, Clone)]
pub struct CreateGroupRequest {
    pub owner_id: UserId,
    pub name: String,
    pub members: Vec<UserId>,
}

pub struct ConversationServiceDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub clock: Arc<dyn Clock>,
}

pub struct ConversationService {
    deps: ConversationServiceDependencies,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies) -> Self {
        Self { deps }
    }

    /// 开启私聊；两人之间已有私聊时恢复双方的成员关系并返回已有会话
    pub async fn start_private(
        &self,
        initiator: UserId,
        peer: UserId,
    ) -> Result<Conversation, ApplicationError> {
        if initiator == peer {
            return Err(DomainError::validation_error("peer", "不能与自己开启私聊").into());
        }

        if let Some(existing) = self
            .deps
            .conversations
            .find_private_between(initiator, peer)
            .await?
        {
            for user_id in [initiator, peer] {
                if !self
                    .deps
                    .conversations
                    .is_active_member(existing.id, user_id)
                    .await?
                {
                    self.deps
                        .conversations
                        .restore_member(existing.id, user_id)
                        .await?;
                    info!(conversation_id = %existing.id, user_id = %user_id, "私聊成员关系已恢复");
                }
            }
            return Ok(existing);
        }

        let now = self.deps.clock.now();
        let conversation = Conversation::private(ConversationId::from(Uuid::new_v4()), now);
        let members = vec![
            ConversationMember::new(conversation.id, initiator, now),
            ConversationMember::new(conversation.id, peer, now),
        ];
        let created = self
            .deps
            .conversations
            .create_conversation(conversation, members)
            .await?;
        info!(conversation_id = %created.id, "私聊已创建");
        Ok(created)
    }

    pub async fn create_group(
        &self,
        request: CreateGroupRequest,
    ) -> Result<Conversation, ApplicationError> {
        let now = self.deps.clock.now();
        let conversation =
            Conversation::group(ConversationId::from(Uuid::new_v4()), request.name, now)?;

        let mut member_ids: BTreeSet<UserId> = request.members.into_iter().collect();
        member_ids.insert(request.owner_id);
        let members = member_ids
            .into_iter()
            .map(|user_id| ConversationMember::new(conversation.id, user_id, now))
            .collect::<Vec<_>>();
        let member_count = members.len();

        let created = self
            .deps
            .conversations
            .create_conversation(conversation, members)
            .await?;
        info!(conversation_id = %created.id, member_count, "群聊已创建");
        Ok(created)
    }

    /// 退出会话（软删除成员关系）
    pub async fn leave(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let removed = self
            .deps
            .conversations
            .remove_member(conversation_id, user_id, self.deps.clock.now())
            .await?;
        if !removed {
            return Err(ApplicationError::NotAMember {
                conversation_id,
                user_id,
            });
        }
        info!(conversation_id = %conversation_id, user_id = %user_id, "成员已退出会话");
        Ok(())
    }
}
