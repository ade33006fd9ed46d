//! 实时核心装配
//!
//! 把注册表、成员解析、在线状态、调度器、服务与入口按依赖顺序连接起来。

use std::sync::Arc;

use domain::{ConversationRepository, MessageRepository, NodeId};
use tokio_util::task::TaskTracker;

use crate::auth::Authenticator;
use crate::broadcaster::FanoutBackend;
use crate::clock::Clock;
use crate::dispatcher::{MessageDispatcher, MessageDispatcherDependencies};
use crate::hub::{RealtimeHub, RealtimeHubDependencies, RealtimeSettings};
use crate::membership::MembershipResolver;
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::services::{
    ConversationService, ConversationServiceDependencies, MessageService,
    MessageServiceDependencies,
};
use crate::stats::RealtimeStats;

pub struct RealtimeCoreDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub authenticator: Arc<dyn Authenticator>,
    pub backend: Arc<dyn FanoutBackend>,
    pub clock: Arc<dyn Clock>,
    pub settings: RealtimeSettings,
    pub node_id: NodeId,
}

#[derive(Clone)]
pub struct RealtimeCore {
    pub hub: Arc<RealtimeHub>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub messages: Arc<MessageService>,
    pub conversations: Arc<ConversationService>,
}

impl RealtimeCore {
    pub fn assemble(deps: RealtimeCoreDependencies) -> Self {
        let stats = Arc::new(RealtimeStats::new());
        let tasks = TaskTracker::new();
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&deps.clock)));
        let resolver = MembershipResolver::new(Arc::clone(&deps.conversations));
        let tracker = Arc::new(PresenceTracker::new(resolver.clone()));

        let dispatcher = Arc::new(MessageDispatcher::new(MessageDispatcherDependencies {
            registry: Arc::clone(&registry),
            resolver,
            tracker: Arc::clone(&tracker),
            backend: deps.backend,
            stats: Arc::clone(&stats),
            node_id: deps.node_id,
            push_timeout: deps.settings.push_timeout,
        }));

        let messages = Arc::new(MessageService::new(MessageServiceDependencies {
            conversations: Arc::clone(&deps.conversations),
            messages: deps.messages,
            dispatcher: Arc::clone(&dispatcher),
            clock: Arc::clone(&deps.clock),
            tasks: tasks.clone(),
        }));

        let conversations = Arc::new(ConversationService::new(ConversationServiceDependencies {
            conversations: deps.conversations,
            clock: deps.clock,
        }));

        let hub = RealtimeHub::new(RealtimeHubDependencies {
            registry,
            tracker,
            dispatcher: Arc::clone(&dispatcher),
            messages: Arc::clone(&messages),
            authenticator: deps.authenticator,
            stats,
            settings: deps.settings,
            tasks,
        });

        Self {
            hub,
            dispatcher,
            messages,
            conversations,
        }
    }
}
