//! 会话实体定义
//!
//! 会话分为一对一私聊和群聊两种；成员关系采用软删除。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 群名称最大长度
pub const MAX_GROUP_NAME_LENGTH: usize = 100;

/// 会话类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationKind {
    /// 一对一私聊
    Private,
    /// 群聊
    Group { name: String },
}

/// 会话实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(flatten)]
    pub kind: ConversationKind,
    pub created_at: Timestamp,
}

impl Conversation {
    /// 创建私聊会话
    pub fn private(id: ConversationId, created_at: Timestamp) -> Self {
        Self {
            id,
            kind: ConversationKind::Private,
            created_at,
        }
    }

    /// 创建群聊会话，校验群名称
    pub fn group(
        id: ConversationId,
        name: impl Into<String>,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        let name = name.into().trim().to_owned();
        if name.is_empty() {
            return Err(DomainError::validation_error("name", "群名称不能为空"));
        }
        if name.chars().count() > MAX_GROUP_NAME_LENGTH {
            return Err(DomainError::validation_error("name", "群名称过长"));
        }
        Ok(Self {
            id,
            kind: ConversationKind::Group { name },
            created_at,
        })
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group { .. })
    }
}

/// 会话成员关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: Timestamp,
    /// 软删除时间；不为空表示已退出
    pub left_at: Option<Timestamp>,
}

impl ConversationMember {
    pub fn new(conversation_id: ConversationId, user_id: UserId, joined_at: Timestamp) -> Self {
        Self {
            conversation_id,
            user_id,
            joined_at,
            left_at: None,
        }
    }

    /// 成员关系是否仍然有效
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}
