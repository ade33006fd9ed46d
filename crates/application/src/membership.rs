//! 会话成员关系解析
//!
//! 每次扇出前都从存储读取最新的有效成员，不在进程内做跨调用缓存。
//! 同一次扇出内对同一会话的重复查询由 `DispatchScope` 去重。

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{ConversationId, ConversationRepository, RepositoryError, UserId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    #[error("membership store unavailable: {0}")]
    StoreUnavailable(String),
}

fn store_unavailable(err: RepositoryError) -> ResolveError {
    ResolveError::StoreUnavailable(err.to_string())
}

#[derive(Clone)]
pub struct MembershipResolver {
    repository: Arc<dyn ConversationRepository>,
}

impl MembershipResolver {
    pub fn new(repository: Arc<dyn ConversationRepository>) -> Self {
        Self { repository }
    }

    /// 会话当前的有效成员。成员为空是合法结果，不是错误。
    pub async fn members_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, ResolveError> {
        let conversation = self
            .repository
            .find_conversation(conversation_id)
            .await
            .map_err(store_unavailable)?;
        if conversation.is_none() {
            return Err(ResolveError::NotFound(conversation_id));
        }

        match self.repository.active_members(conversation_id).await {
            Ok(members) => Ok(members.into_iter().collect()),
            // 查询期间会话被删除
            Err(RepositoryError::NotFound) => Err(ResolveError::NotFound(conversation_id)),
            Err(err) => Err(store_unavailable(err)),
        }
    }

    /// 用户仍是有效成员的全部会话
    pub async fn conversations_of(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationId>, ResolveError> {
        self.repository
            .conversations_of(user_id)
            .await
            .map_err(store_unavailable)
    }

    /// 开启一次扇出范围内的查询缓存
    pub fn scope(&self) -> DispatchScope<'_> {
        DispatchScope {
            resolver: self,
            cache: HashMap::new(),
        }
    }
}

/// 单次扇出内的成员查询缓存，随扇出结束而丢弃
pub struct DispatchScope<'a> {
    resolver: &'a MembershipResolver,
    cache: HashMap<ConversationId, HashSet<UserId>>,
}

impl DispatchScope<'_> {
    pub async fn members_of(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<&HashSet<UserId>, ResolveError> {
        match self.cache.entry(conversation_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let members = self.resolver.members_of(conversation_id).await?;
                Ok(entry.insert(members))
            }
        }
    }
}
