//! 在线状态跟踪
//!
//! 在线状态不单独存储，由注册表中用户的连接数推导：
//! 连接数 0 → 1 为上线，1 → 0 为下线。迁移所依据的连接数必须来自
//! 注册表修改时的同一个临界区（见 `Registration::live_sessions`）。

use std::collections::HashSet;

use domain::{PresenceTransition, UserId};
use tracing::{debug, info};

use crate::membership::{MembershipResolver, ResolveError};

pub struct PresenceTracker {
    resolver: MembershipResolver,
}

impl PresenceTracker {
    pub fn new(resolver: MembershipResolver) -> Self {
        Self { resolver }
    }

    /// 注册后调用，`live_sessions` 为注册完成后的连接数
    pub fn on_session_opened(&self, user_id: UserId, live_sessions: usize) -> PresenceTransition {
        if live_sessions == 1 {
            info!(user_id = %user_id, "用户上线");
            PresenceTransition::BecameOnline
        } else {
            debug!(user_id = %user_id, live_sessions, "用户新增连接");
            PresenceTransition::NoChange
        }
    }

    /// 注销后调用，`live_sessions` 为注销完成后的连接数
    pub fn on_session_closed(&self, user_id: UserId, live_sessions: usize) -> PresenceTransition {
        if live_sessions == 0 {
            info!(user_id = %user_id, "用户下线");
            PresenceTransition::BecameOffline
        } else {
            debug!(user_id = %user_id, live_sessions, "用户关闭一条连接");
            PresenceTransition::NoChange
        }
    }

    /// 需要收到该用户在线状态变化的用户：所有共同会话成员的并集，不含本人
    pub async fn peers_to_notify(&self, user_id: UserId) -> Result<HashSet<UserId>, ResolveError> {
        let conversations = self.resolver.conversations_of(user_id).await?;
        let mut scope = self.resolver.scope();
        let mut peers = HashSet::new();

        for conversation_id in conversations {
            match scope.members_of(conversation_id).await {
                Ok(members) => peers.extend(members.iter().copied()),
                // 会话在两次查询之间被删除
                Err(ResolveError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }

        peers.remove(&user_id);
        Ok(peers)
    }
}
