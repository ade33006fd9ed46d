//! 会话注册表
//!
//! 进程内唯一记录“谁在线、通过哪些连接在线”的结构。
//!
//! 两张分片表：
//! - `sessions`：连接ID → 会话条目
//! - `users`：用户ID → 该用户的全部推送目标与最后离线时间
//!
//! 注册和注销时，用户条目的分片锁在修改期间一直持有，返回的
//! `live_sessions` 就是本次修改完成那一刻的连接数。在线状态迁移
//! 只根据这个数值判定，因此并发的注册/注销不会产生重复或遗漏的迁移。
//! 加锁顺序固定为先 `sessions` 后 `users`。

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ConnectionId, ConversationId, PresenceState, Session, Timestamp, UserId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::transport::Outbound;

/// 某条连接的推送入口
#[derive(Debug, Clone)]
pub struct PushTarget {
    connection_id: ConnectionId,
    outbox: mpsc::Sender<Outbound>,
    evict: CancellationToken,
}

impl PushTarget {
    pub fn new(
        connection_id: ConnectionId,
        outbox: mpsc::Sender<Outbound>,
        evict: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            outbox,
            evict,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn outbox(&self) -> &mpsc::Sender<Outbound> {
        &self.outbox
    }

    /// 通知连接任务关闭，实际注销由连接任务完成
    pub fn evict(&self) {
        self.evict.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evict.is_cancelled()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

/// 注册结果
#[derive(Debug, Clone)]
pub struct Registration {
    pub session: Session,
    /// 注册完成后该用户的连接数
    pub live_sessions: usize,
}

/// 注销结果
#[derive(Debug, Clone)]
pub struct Deregistration {
    pub session: Session,
    /// 注销完成后该用户的连接数
    pub live_sessions: usize,
}

#[derive(Debug, Default)]
struct UserSlot {
    targets: HashMap<ConnectionId, PushTarget>,
    last_seen: Option<Timestamp>,
}

pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
    users: DashMap<UserId, UserSlot>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            users: DashMap::new(),
            clock,
        }
    }

    /// 登记一条已认证的连接。
    ///
    /// 连接ID已存在时返回 `DuplicateConnection`，注册表保持不变。
    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        target: PushTarget,
    ) -> Result<Registration, RegistryError> {
        let vacant = match self.sessions.entry(connection_id) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateConnection(connection_id)),
            Entry::Vacant(vacant) => vacant,
        };

        let session = Session::new(connection_id, user_id, self.clock.now());
        let live_sessions = {
            let mut slot = self.users.entry(user_id).or_default();
            slot.targets.insert(connection_id, target);
            slot.targets.len()
        };
        vacant.insert(session.clone());

        Ok(Registration {
            session,
            live_sessions,
        })
    }

    /// 移除一条连接；连接不存在（已被注销）时返回 `None`
    pub fn deregister(&self, connection_id: ConnectionId) -> Option<Deregistration> {
        let (_, session) = self.sessions.remove(&connection_id)?;

        let live_sessions = match self.users.get_mut(&session.user_id) {
            Some(mut slot) => {
                slot.targets.remove(&connection_id);
                if slot.targets.is_empty() {
                    slot.last_seen = Some(self.clock.now());
                }
                slot.targets.len()
            }
            None => 0,
        };

        Some(Deregistration {
            session,
            live_sessions,
        })
    }

    pub fn session(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions.get(&connection_id).map(|s| s.clone())
    }

    /// 用户当前的全部会话条目
    pub fn sessions_for(&self, user_id: UserId) -> Vec<Session> {
        let ids: Vec<ConnectionId> = match self.users.get(&user_id) {
            Some(slot) => slot.targets.keys().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| self.session(id))
            .collect()
    }

    /// 用户当前的全部推送目标（快照）
    pub fn push_targets(&self, user_id: UserId) -> Vec<PushTarget> {
        self.users
            .get(&user_id)
            .map(|slot| slot.targets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users
            .get(&user_id)
            .map(|slot| !slot.targets.is_empty())
            .unwrap_or(false)
    }

    /// 在线状态视图：在线时 `last_seen` 为当前时间
    pub fn presence(&self, user_id: UserId) -> PresenceState {
        let (online, last_seen) = match self.users.get(&user_id) {
            Some(slot) if !slot.targets.is_empty() => (true, Some(self.clock.now())),
            Some(slot) => (false, slot.last_seen),
            None => (false, None),
        };
        PresenceState {
            user_id,
            online,
            last_seen,
        }
    }

    /// 设置连接当前查看的会话；连接不存在时返回 false
    pub fn set_focus(&self, connection_id: ConnectionId, focused: Option<ConversationId>) -> bool {
        match self.sessions.get_mut(&connection_id) {
            Some(mut session) => {
                session.focused = focused;
                true
            }
            None => false,
        }
    }

    /// 正在查看某个会话的连接
    pub fn viewers_of(&self, conversation_id: ConversationId) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.focused == Some(conversation_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 要求连接关闭；连接不存在时返回 false
    pub fn evict(&self, connection_id: ConnectionId) -> bool {
        let user_id = match self.sessions.get(&connection_id) {
            Some(session) => session.user_id,
            None => return false,
        };
        let target = self
            .users
            .get(&user_id)
            .and_then(|slot| slot.targets.get(&connection_id).cloned());
        match target {
            Some(target) => {
                target.evict();
                true
            }
            None => false,
        }
    }

    pub fn live_connections(&self) -> usize {
        self.sessions.len()
    }

    pub fn online_users(&self) -> usize {
        self.users
            .iter()
            .filter(|slot| !slot.targets.is_empty())
            .count()
    }
}
