//! 实时核心对外入口
//!
//! 传输层（WebSocket 处理器）只与 `RealtimeHub` 交互：
//! 建立连接、强制断开、通知新消息、查询在线状态、关闭服务。

use std::sync::Arc;
use std::time::Duration;

use config::RealtimeConfig;
use domain::{
    ConnectionId, ConversationId, MessageSummary, PresenceState, PresenceTransition, Session,
    UserId,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::auth::{AuthFailure, Authenticator, Credential};
use crate::connection::{CloseReason, ConnectionSession};
use crate::dispatcher::{run_detached, DispatchError, DispatchReport, MessageDispatcher};
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::services::MessageService;
use crate::stats::{RealtimeStats, RealtimeStatsSnapshot};
use crate::transport::Transport;

/// 实时连接参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeSettings {
    pub outbox_capacity: usize,
    pub push_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&RealtimeConfig> for RealtimeSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            outbox_capacity: config.outbox_capacity.max(1),
            push_timeout: config.push_timeout(),
            write_timeout: config.write_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

/// 连接被拒绝的原因
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("authentication failed: {0}")]
    AuthFailure(AuthFailure),
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

pub struct RealtimeHubDependencies {
    pub registry: Arc<SessionRegistry>,
    pub tracker: Arc<PresenceTracker>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub messages: Arc<MessageService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub stats: Arc<RealtimeStats>,
    pub settings: RealtimeSettings,
    /// 连接任务与后台扇出共用，关闭时统一等待
    pub tasks: TaskTracker,
}

pub struct RealtimeHub {
    registry: Arc<SessionRegistry>,
    tracker: Arc<PresenceTracker>,
    dispatcher: Arc<MessageDispatcher>,
    messages: Arc<MessageService>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RealtimeStats>,
    settings: RealtimeSettings,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RealtimeHub {
    pub fn new(deps: RealtimeHubDependencies) -> Arc<Self> {
        Arc::new(Self {
            registry: deps.registry,
            tracker: deps.tracker,
            dispatcher: deps.dispatcher,
            messages: deps.messages,
            authenticator: deps.authenticator,
            stats: deps.stats,
            settings: deps.settings,
            shutdown: CancellationToken::new(),
            tasks: deps.tasks,
        })
    }

    /// 认证并激活一条新连接，成功后连接在后台任务中运行
    pub async fn on_connect<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        credential: Credential,
    ) -> Result<ConnectionId, Rejection> {
        self.connect_as(ConnectionId::generate(), transport, credential)
            .await
    }

    /// 以指定的连接ID建立连接
    pub async fn connect_as<T: Transport>(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        transport: T,
        credential: Credential,
    ) -> Result<ConnectionId, Rejection> {
        let session = ConnectionSession::new(connection_id, Arc::clone(self), transport);
        let active = session.open(&credential).await?;
        self.tasks.spawn(active.run());
        Ok(connection_id)
    }

    /// 强制断开连接；连接不存在时返回 false
    pub fn on_disconnect(&self, connection_id: ConnectionId) -> bool {
        self.registry.evict(connection_id)
    }

    /// 通知新消息（消息已由调用方持久化），调用方被取消时扇出照常完成
    pub async fn notify_message(
        &self,
        conversation_id: ConversationId,
        message: &MessageSummary,
    ) -> Result<DispatchReport, DispatchError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let message = message.clone();
        run_detached(&self.tasks, async move {
            dispatcher.dispatch_message(&message, conversation_id).await
        })
        .await
    }

    pub fn notify_presence_query(&self, user_id: UserId) -> PresenceState {
        self.registry.presence(user_id)
    }

    pub fn viewers_of(&self, conversation_id: ConversationId) -> Vec<Session> {
        self.registry.viewers_of(conversation_id)
    }

    pub fn stats(&self) -> &RealtimeStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> RealtimeStatsSnapshot {
        self.stats.snapshot(
            self.registry.live_connections(),
            self.registry.online_users(),
        )
    }

    /// 关闭所有连接并等待连接任务和后台扇出结束
    pub async fn shutdown(&self) {
        info!(
            live_connections = self.registry.live_connections(),
            "实时核心开始关闭"
        );
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("实时核心已关闭");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn messages(&self) -> &Arc<MessageService> {
        &self.messages
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    pub(crate) fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    pub(crate) fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 在后台推送在线状态变化
    pub(crate) fn announce(&self, user_id: UserId, transition: PresenceTransition) {
        if !transition.is_change() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!(user_id = %user_id, ?transition, "没有可用的运行时，跳过在线状态推送");
            return;
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        self.tasks.spawn_on(
            async move {
                // 失败已在调度器中记录
                let _ = dispatcher.dispatch_presence(user_id, transition).await;
            },
            &handle,
        );
    }

    /// 注销连接并推送可能的下线迁移
    pub(crate) fn release(&self, connection_id: ConnectionId, reason: CloseReason) {
        let Some(removed) = self.registry.deregister(connection_id) else {
            return;
        };
        let user_id = removed.session.user_id;
        debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            live_sessions = removed.live_sessions,
            reason = reason.as_str(),
            "连接已注销"
        );
        let transition = self
            .tracker
            .on_session_closed(user_id, removed.live_sessions);
        self.announce(user_id, transition);
    }
}
