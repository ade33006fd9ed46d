//! 消息与在线状态扇出
//!
//! 保证：
//! - 同一会话的扇出按进入顺序串行执行；每个连接的发送队列是 FIFO，
//!   所以任意接收者看到的同一会话事件顺序与扇出顺序一致。
//! - 同一用户的在线状态扇出按顺序执行，过期的迁移（执行时状态已被
//!   后续迁移覆盖）直接跳过。
//! - 单个连接推送失败不影响其他连接；超时的连接被驱逐。
//! - 受众解析失败只中止本次扇出。

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use domain::{
    AckPayload, ConnectionId, ConversationId, MessageId, MessageSummary, NodeId,
    PresenceTransition, ServerFrame, Timestamp, UserId,
};
use futures::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::broadcaster::{FanoutBackend, RemoteDispatch};
use crate::membership::{MembershipResolver, ResolveError};
use crate::ordering::OrderingKeys;
use crate::presence::PresenceTracker;
use crate::registry::{PushTarget, SessionRegistry};
use crate::stats::RealtimeStats;
use crate::transport::Outbound;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("failed to resolve audience: {0}")]
    Audience(#[from] ResolveError),
    #[error("dispatch task did not finish: {0}")]
    Interrupted(String),
}

/// 在 `tasks` 跟踪的后台任务中执行扇出并等待结果
///
/// 调用方的 future 被取消时任务照常执行完，关闭时由 `TaskTracker::wait` 等待。
pub(crate) async fn run_detached<F>(
    tasks: &TaskTracker,
    dispatch: F,
) -> Result<DispatchReport, DispatchError>
where
    F: Future<Output = Result<DispatchReport, DispatchError>> + Send + 'static,
{
    tasks
        .spawn(dispatch)
        .await
        .unwrap_or_else(|err| Err(DispatchError::Interrupted(err.to_string())))
}

/// 一次扇出的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 解析出的受众人数（不论是否在线）
    pub recipients: usize,
    /// 成功放入发送队列的连接数
    pub delivered: usize,
    /// 接收端已关闭的连接
    pub gone: Vec<ConnectionId>,
    /// 推送超时并被驱逐的连接
    pub timed_out: Vec<ConnectionId>,
}

impl DispatchReport {
    pub fn failures(&self) -> usize {
        self.gone.len() + self.timed_out.len()
    }
}

enum PushOutcome {
    Delivered,
    Gone,
    TimedOut,
}

pub struct MessageDispatcherDependencies {
    pub registry: Arc<SessionRegistry>,
    pub resolver: MembershipResolver,
    pub tracker: Arc<PresenceTracker>,
    pub backend: Arc<dyn FanoutBackend>,
    pub stats: Arc<RealtimeStats>,
    pub node_id: NodeId,
    pub push_timeout: Duration,
}

pub struct MessageDispatcher {
    registry: Arc<SessionRegistry>,
    resolver: MembershipResolver,
    tracker: Arc<PresenceTracker>,
    backend: Arc<dyn FanoutBackend>,
    stats: Arc<RealtimeStats>,
    node_id: NodeId,
    push_timeout: Duration,
    conversation_lanes: OrderingKeys<ConversationId>,
    presence_lanes: OrderingKeys<UserId>,
}

impl MessageDispatcher {
    pub fn new(deps: MessageDispatcherDependencies) -> Self {
        Self {
            registry: deps.registry,
            resolver: deps.resolver,
            tracker: deps.tracker,
            backend: deps.backend,
            stats: deps.stats,
            node_id: deps.node_id,
            push_timeout: deps.push_timeout,
            conversation_lanes: OrderingKeys::new(),
            presence_lanes: OrderingKeys::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// 把已持久化的消息推送给会话的全部在线成员（含发送者的其他连接）
    pub async fn dispatch_message(
        &self,
        message: &MessageSummary,
        conversation_id: ConversationId,
    ) -> Result<DispatchReport, DispatchError> {
        if message.conversation_id() != conversation_id {
            warn!(
                message_id = %message.id,
                conversation_id = %conversation_id,
                "消息所属会话与扇出目标不一致，以扇出目标为准"
            );
        }

        self.conversation_lanes
            .serialize(conversation_id, async {
                let audience = self.resolve_conversation(conversation_id).await?;
                let frame = Arc::new(ServerFrame::Message {
                    conversation_id,
                    payload: message.clone(),
                });

                let report = self.deliver(&audience, &frame).await;
                self.publish_remote(audience, frame).await;
                self.stats.record_message_dispatched();

                debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    recipients = report.recipients,
                    delivered = report.delivered,
                    failures = report.failures(),
                    "消息扇出完成"
                );
                Ok(report)
            })
            .await
    }

    /// 把在线状态变化推送给所有共同会话成员，不含本人
    pub async fn dispatch_presence(
        &self,
        user_id: UserId,
        transition: PresenceTransition,
    ) -> Result<DispatchReport, DispatchError> {
        if !transition.is_change() {
            return Ok(DispatchReport::default());
        }

        self.presence_lanes
            .serialize(user_id, async {
                let online = self.registry.is_online(user_id);
                let still_current = match transition {
                    PresenceTransition::BecameOnline => online,
                    PresenceTransition::BecameOffline => !online,
                    PresenceTransition::NoChange => false,
                };
                if !still_current {
                    debug!(user_id = %user_id, ?transition, "在线状态迁移已被后续迁移覆盖，跳过");
                    return Ok(DispatchReport::default());
                }

                let peers = match self.tracker.peers_to_notify(user_id).await {
                    Ok(peers) => peers,
                    Err(err) => {
                        self.stats.record_audience_failure();
                        warn!(user_id = %user_id, ?transition, error = %err, "无法解析在线状态的通知对象，跳过本次推送");
                        return Err(err.into());
                    }
                };

                let frame = Arc::new(ServerFrame::Presence {
                    user_id,
                    payload: self.registry.presence(user_id),
                });
                let report = self.deliver(&peers, &frame).await;
                self.publish_remote(peers, frame).await;
                self.stats.record_presence_event();

                debug!(
                    user_id = %user_id,
                    ?transition,
                    recipients = report.recipients,
                    delivered = report.delivered,
                    "在线状态扇出完成"
                );
                Ok(report)
            })
            .await
    }

    /// 已读回执：与消息共用会话串行通道，推送给除读者外的成员
    pub async fn dispatch_ack(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        message_id: MessageId,
        seen_at: Timestamp,
    ) -> Result<DispatchReport, DispatchError> {
        self.conversation_lanes
            .serialize(conversation_id, async {
                let mut audience = self.resolve_conversation(conversation_id).await?;
                audience.remove(&reader_id);

                let frame = Arc::new(ServerFrame::Ack {
                    conversation_id,
                    user_id: reader_id,
                    payload: AckPayload {
                        message_id,
                        seen_at,
                    },
                });
                let report = self.deliver(&audience, &frame).await;
                self.publish_remote(audience, frame).await;
                self.stats.record_ack_dispatched();
                Ok(report)
            })
            .await
    }

    /// 消息被修改：与新消息共用会话串行通道，推送给会话的全部在线成员
    pub async fn dispatch_edit(
        &self,
        message: &MessageSummary,
    ) -> Result<DispatchReport, DispatchError> {
        let conversation_id = message.conversation_id();
        self.conversation_lanes
            .serialize(conversation_id, async {
                let audience = self.resolve_conversation(conversation_id).await?;
                let frame = Arc::new(ServerFrame::MessageEdited {
                    conversation_id,
                    payload: message.clone(),
                });
                Ok(self.fan_out_update(audience, frame).await)
            })
            .await
    }

    /// 消息被删除：对所有人删除时推送给全部成员，否则只推送给作者自己的连接
    pub async fn dispatch_deletion(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        author_id: UserId,
        for_everyone: bool,
    ) -> Result<DispatchReport, DispatchError> {
        self.conversation_lanes
            .serialize(conversation_id, async {
                let audience = if for_everyone {
                    self.resolve_conversation(conversation_id).await?
                } else {
                    HashSet::from([author_id])
                };
                let frame = Arc::new(ServerFrame::MessageDeleted {
                    conversation_id,
                    message_id,
                    for_everyone,
                });
                Ok(self.fan_out_update(audience, frame).await)
            })
            .await
    }

    async fn fan_out_update(
        &self,
        audience: HashSet<UserId>,
        frame: Arc<ServerFrame>,
    ) -> DispatchReport {
        let report = self.deliver(&audience, &frame).await;
        self.publish_remote(audience, frame).await;
        self.stats.record_update_dispatched();
        report
    }

    /// 投递其他进程转发来的扇出，只推送给本地连接
    pub async fn deliver_remote(&self, dispatch: RemoteDispatch) -> DispatchReport {
        if dispatch.origin == self.node_id {
            return DispatchReport::default();
        }

        let audience: HashSet<UserId> = dispatch.audience.into_iter().collect();
        let frame = Arc::new(dispatch.frame);
        let report = self.deliver(&audience, &frame).await;
        self.stats.record_remote_dispatch();
        debug!(
            origin = %dispatch.origin,
            kind = frame.kind(),
            delivered = report.delivered,
            "远程扇出已投递"
        );
        report
    }

    async fn resolve_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, DispatchError> {
        match self.resolver.members_of(conversation_id).await {
            Ok(audience) => Ok(audience),
            Err(err) => {
                self.stats.record_audience_failure();
                error!(conversation_id = %conversation_id, error = %err, "受众解析失败，放弃本次扇出");
                Err(err.into())
            }
        }
    }

    /// 并发推送到所有受众的全部连接
    async fn deliver(
        &self,
        audience: &HashSet<UserId>,
        frame: &Arc<ServerFrame>,
    ) -> DispatchReport {
        let targets: Vec<PushTarget> = audience
            .iter()
            .flat_map(|user_id| self.registry.push_targets(*user_id))
            .collect();

        let outcomes = join_all(
            targets
                .iter()
                .map(|target| self.push(target, Arc::clone(frame))),
        )
        .await;

        let mut report = DispatchReport {
            recipients: audience.len(),
            ..DispatchReport::default()
        };
        for (target, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::Gone => report.gone.push(target.connection_id()),
                PushOutcome::TimedOut => {
                    warn!(
                        connection_id = %target.connection_id(),
                        kind = frame.kind(),
                        "推送超时，驱逐连接"
                    );
                    target.evict();
                    report.timed_out.push(target.connection_id());
                }
            }
        }

        self.stats
            .record_push_results(report.delivered, report.timed_out.len(), report.gone.len());
        report
    }

    async fn push(&self, target: &PushTarget, frame: Arc<ServerFrame>) -> PushOutcome {
        if target.is_evicted() {
            return PushOutcome::Gone;
        }
        match timeout(self.push_timeout, target.outbox().send(Outbound::Frame(frame))).await {
            Ok(Ok(())) => PushOutcome::Delivered,
            // 连接已在关闭流程中，注销由连接任务完成
            Ok(Err(_)) => PushOutcome::Gone,
            Err(_) => PushOutcome::TimedOut,
        }
    }

    async fn publish_remote(&self, audience: HashSet<UserId>, frame: Arc<ServerFrame>) {
        if !self.backend.forwards() || audience.is_empty() {
            return;
        }

        let dispatch = RemoteDispatch {
            origin: self.node_id,
            audience: audience.into_iter().collect(),
            frame: frame.as_ref().clone(),
        };
        if let Err(err) = self.backend.publish(dispatch).await {
            self.stats.record_publish_failure();
            error!(kind = frame.kind(), error = %err, "跨进程转发失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::LocalOnlyBackend;
    use crate::clock::SystemClock;
    use crate::memory::InMemoryConversationRepository;
    use chrono::Utc;
    use domain::{MessageContent, MessageEnvelope};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        repo: Arc<InMemoryConversationRepository>,
        dispatcher: MessageDispatcher,
    }

    fn fixture(push_timeout: Duration) -> Fixture {
        let registry = Arc::new(SessionRegistry::new(Arc::new(SystemClock)));
        let repo = Arc::new(InMemoryConversationRepository::new());
        let resolver = MembershipResolver::new(repo.clone());
        let dispatcher = MessageDispatcher::new(MessageDispatcherDependencies {
            registry: Arc::clone(&registry),
            resolver: resolver.clone(),
            tracker: Arc::new(PresenceTracker::new(resolver)),
            backend: Arc::new(LocalOnlyBackend),
            stats: Arc::new(RealtimeStats::new()),
            node_id: NodeId::generate(),
            push_timeout,
        });
        Fixture {
            registry,
            repo,
            dispatcher,
        }
    }

    fn connect(
        registry: &SessionRegistry,
        user_id: UserId,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>, CancellationToken) {
        let connection_id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(capacity);
        let evict = CancellationToken::new();
        registry
            .register(
                user_id,
                connection_id,
                PushTarget::new(connection_id, tx, evict.clone()),
            )
            .unwrap();
        (connection_id, rx, evict)
    }

    fn summary(conversation_id: ConversationId, author_id: UserId, text: &str) -> MessageSummary {
        MessageSummary {
            id: MessageId::from(Uuid::new_v4()),
            envelope: MessageEnvelope {
                author_id,
                conversation_id,
                reply_to: None,
            },
            content: MessageContent::text(text),
            reply_preview: None,
            created_at: Utc::now(),
            edited_at: None,
            seen_by: Vec::new(),
        }
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[tokio::test]
    async fn slow_connection_is_evicted_without_blocking_others() {
        let f = fixture(Duration::from_millis(50));
        let (alice, bob) = (user(), user());
        let conversation = f.repo.insert_group("ops", &[alice, bob]).await;

        let (slow, _slow_rx, slow_evict) = connect(&f.registry, alice, 1);
        let (_, mut fast_rx, _) = connect(&f.registry, bob, 8);

        let first = summary(conversation, bob, "one");
        let second = summary(conversation, bob, "two");
        f.dispatcher.dispatch_message(&first, conversation).await.unwrap();
        let report = f.dispatcher.dispatch_message(&second, conversation).await.unwrap();

        assert_eq!(report.timed_out, vec![slow]);
        assert_eq!(report.delivered, 1);
        assert!(slow_evict.is_cancelled());
        assert!(matches!(fast_rx.recv().await, Some(Outbound::Frame(_))));
        assert!(matches!(fast_rx.recv().await, Some(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn ack_excludes_reader() {
        let f = fixture(Duration::from_secs(1));
        let (alice, bob) = (user(), user());
        let conversation = f.repo.insert_group("pair", &[alice, bob]).await;
        let (_, mut alice_rx, _) = connect(&f.registry, alice, 8);
        let (_, mut bob_rx, _) = connect(&f.registry, bob, 8);

        let report = f
            .dispatcher
            .dispatch_ack(conversation, alice, MessageId::from(Uuid::new_v4()), Utc::now())
            .await
            .unwrap();

        assert_eq!(report.recipients, 1);
        assert!(alice_rx.try_recv().is_err());
        match bob_rx.recv().await {
            Some(Outbound::Frame(frame)) => assert_eq!(frame.kind(), "ack"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn author_only_deletion_reaches_only_the_author() {
        let f = fixture(Duration::from_secs(1));
        let (alice, bob) = (user(), user());
        let conversation = f.repo.insert_group("pair", &[alice, bob]).await;
        let (_, mut alice_rx, _) = connect(&f.registry, alice, 8);
        let (_, mut bob_rx, _) = connect(&f.registry, bob, 8);
        let message_id = MessageId::from(Uuid::new_v4());

        let report = f
            .dispatcher
            .dispatch_deletion(conversation, message_id, alice, false)
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert!(bob_rx.try_recv().is_err());
        match alice_rx.recv().await {
            Some(Outbound::Frame(frame)) => assert_eq!(frame.kind(), "message_deleted"),
            other => panic!("unexpected {other:?}"),
        }

        let report = f
            .dispatcher
            .dispatch_deletion(conversation, message_id, alice, true)
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert!(matches!(bob_rx.recv().await, Some(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn edit_follows_the_original_on_the_conversation_lane() {
        let f = fixture(Duration::from_secs(1));
        let (alice, bob) = (user(), user());
        let conversation = f.repo.insert_group("pair", &[alice, bob]).await;
        let (_, mut bob_rx, _) = connect(&f.registry, bob, 8);

        let original = summary(conversation, alice, "draft");
        let edited = MessageSummary {
            content: MessageContent::text("final"),
            edited_at: Some(Utc::now()),
            ..original.clone()
        };
        f.dispatcher.dispatch_message(&original, conversation).await.unwrap();
        f.dispatcher.dispatch_edit(&edited).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(Outbound::Frame(frame)) = bob_rx.try_recv() {
            kinds.push(frame.kind());
        }
        assert_eq!(kinds, vec!["message", "message_edited"]);
    }

    #[tokio::test]
    async fn stale_presence_transition_is_skipped() {
        let f = fixture(Duration::from_secs(1));
        let (alice, bob) = (user(), user());
        f.repo.insert_group("pair", &[alice, bob]).await;
        let (_, mut bob_rx, _) = connect(&f.registry, bob, 8);

        // alice 已不在线，上线迁移过期
        let report = f
            .dispatcher
            .dispatch_presence(alice, PresenceTransition::BecameOnline)
            .await
            .unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_conversation_aborts_dispatch() {
        let f = fixture(Duration::from_secs(1));
        let conversation = ConversationId::from(Uuid::new_v4());
        let err = f
            .dispatcher
            .dispatch_message(&summary(conversation, user(), "x"), conversation)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Audience(ResolveError::NotFound(conversation)));
    }

    #[tokio::test]
    async fn remote_dispatch_from_self_is_ignored() {
        let f = fixture(Duration::from_secs(1));
        let alice = user();
        let (_, mut rx, _) = connect(&f.registry, alice, 8);
        let frame = ServerFrame::Presence {
            user_id: alice,
            payload: f.registry.presence(alice),
        };

        let own = RemoteDispatch {
            origin: f.dispatcher.node_id(),
            audience: vec![alice],
            frame: frame.clone(),
        };
        assert_eq!(f.dispatcher.deliver_remote(own).await.delivered, 0);

        let foreign = RemoteDispatch {
            origin: NodeId::generate(),
            audience: vec![alice],
            frame,
        };
        assert_eq!(f.dispatcher.deliver_remote(foreign).await.delivered, 1);
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
    }
}
