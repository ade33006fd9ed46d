//! 连接会话与在线状态
//!
//! `Session` 只由会话注册表创建和销毁；`PresenceState` 是注册表的派生视图，
//! 不单独存储。

use serde::{Deserialize, Serialize};

use crate::value_objects::{ConnectionId, ConversationId, Timestamp, UserId};

/// 单条已认证实时连接在注册表中的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// 当前正在查看的会话（可选）
    pub focused: Option<ConversationId>,
    pub created_at: Timestamp,
}

impl Session {
    pub fn new(connection_id: ConnectionId, user_id: UserId, created_at: Timestamp) -> Self {
        Self {
            connection_id,
            user_id,
            focused: None,
            created_at,
        }
    }
}

/// 用户在线状态视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: UserId,
    pub online: bool,
    /// 在线时为查询时间；离线时为最后一次断开时间，从未连接过则为空
    pub last_seen: Option<Timestamp>,
}

/// 在线状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceTransition {
    /// 首个连接建立（0 → 1）
    BecameOnline,
    /// 最后一个连接断开（1 → 0）
    BecameOffline,
    NoChange,
}

impl PresenceTransition {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoChange)
    }
}
