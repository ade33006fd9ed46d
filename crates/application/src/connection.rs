//! 单条实时连接的生命周期
//!
//! 状态：`Connecting` → `Authenticated` → `Active` → `Closed`，`Closed` 为终态。
//!
//! 连接激活后由两个任务驱动：
//! - 写任务：按 FIFO 顺序把发送队列中的帧写入传输层
//! - 读任务（`ActiveConnection::run`）：处理入站帧，监听空闲超时与驱逐信号
//!
//! 注册表条目由 `SessionLease` 持有，无论连接以何种方式结束都恰好注销一次。

use std::sync::Arc;
use std::time::Duration;

use domain::{
    ClientFrame, CloseCode, ConnectionId, ErrorCode, ServerFrame, UserId,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::hub::{RealtimeHub, Rejection};
use crate::registry::{PushTarget, RegistryError};
use crate::services::{DeleteMessageRequest, EditMessageRequest, SendMessageRequest};
use crate::transport::{FrameSink, FrameSource, Inbound, Outbound, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closed)
                | (Active, Closed)
        )
    }
}

/// 连接关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    AuthFailed,
    DuplicateConnection,
    ClientClosed,
    Logout,
    IdleTimeout,
    Evicted,
    TransportError,
    Shutdown,
}

impl CloseReason {
    pub fn close_code(self) -> CloseCode {
        match self {
            CloseReason::AuthFailed => CloseCode::AUTH_FAILED,
            CloseReason::DuplicateConnection => CloseCode::DUPLICATE_CONNECTION,
            CloseReason::ClientClosed | CloseReason::Logout | CloseReason::Shutdown => {
                CloseCode::NORMAL
            }
            CloseReason::IdleTimeout => CloseCode::IDLE_TIMEOUT,
            CloseReason::Evicted => CloseCode::EVICTED,
            CloseReason::TransportError => CloseCode::INTERNAL_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::DuplicateConnection => "duplicate_connection",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Logout => "logout",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Evicted => "evicted",
            CloseReason::TransportError => "transport_error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// 注册表条目的所有权：`release` 或 `Drop` 时注销，只执行一次
pub(crate) struct SessionLease {
    hub: Option<Arc<RealtimeHub>>,
    connection_id: ConnectionId,
}

impl SessionLease {
    fn new(hub: Arc<RealtimeHub>, connection_id: ConnectionId) -> Self {
        Self {
            hub: Some(hub),
            connection_id,
        }
    }

    fn release(mut self, reason: CloseReason) {
        if let Some(hub) = self.hub.take() {
            hub.release(self.connection_id, reason);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.take() {
            warn!(connection_id = %self.connection_id, "连接任务异常结束，补做注销");
            hub.release(self.connection_id, CloseReason::TransportError);
        }
    }
}

/// 尚未激活的连接
pub struct ConnectionSession<T: Transport> {
    connection_id: ConnectionId,
    state: ConnectionState,
    hub: Arc<RealtimeHub>,
    sink: T::Sink,
    source: T::Source,
}

impl<T: Transport> ConnectionSession<T> {
    pub fn new(connection_id: ConnectionId, hub: Arc<RealtimeHub>, transport: T) -> Self {
        let (sink, source) = transport.split();
        Self {
            connection_id,
            state: ConnectionState::Connecting,
            hub,
            sink,
            source,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(
                connection_id = %self.connection_id,
                from = ?self.state,
                to = ?next,
                "非法的连接状态迁移，已忽略"
            );
            return;
        }
        self.state = next;
    }

    /// 认证并注册连接。失败时已向客户端发送错误帧并关闭传输。
    pub async fn open(mut self, credential: &Credential) -> Result<ActiveConnection<T>, Rejection> {
        let user_id = match self.hub.authenticator().authenticate(credential).await {
            Ok(user_id) => user_id,
            Err(failure) => {
                warn!(connection_id = %self.connection_id, error = %failure, "连接认证失败");
                self.reject(CloseReason::AuthFailed, ErrorCode::AuthFailed, failure.to_string())
                    .await;
                return Err(Rejection::AuthFailure(failure));
            }
        };
        self.transition(ConnectionState::Authenticated);

        let settings = self.hub.settings().clone();
        let (outbox, outbox_rx) = mpsc::channel(settings.outbox_capacity);
        let evict = self.hub.shutdown_token().child_token();
        let target = PushTarget::new(self.connection_id, outbox.clone(), evict.clone());
        // ready 帧在注册前入队，保证它是客户端收到的第一帧；新建的队列必然有空位
        let ready = ServerFrame::Ready {
            connection_id: self.connection_id,
            user_id,
        };
        let _ = outbox.try_send(Outbound::Frame(Arc::new(ready)));

        let registration = match self.hub.registry().register(user_id, self.connection_id, target) {
            Ok(registration) => registration,
            Err(RegistryError::DuplicateConnection(connection_id)) => {
                warn!(connection_id = %connection_id, user_id = %user_id, "连接ID重复，拒绝注册");
                self.reject(
                    CloseReason::DuplicateConnection,
                    ErrorCode::DuplicateConnection,
                    "connection is already registered",
                )
                .await;
                return Err(Rejection::DuplicateConnection(connection_id));
            }
        };
        let lease = SessionLease::new(Arc::clone(&self.hub), self.connection_id);
        self.transition(ConnectionState::Active);
        self.hub.stats().record_connection_opened();

        let transition = self
            .hub
            .tracker()
            .on_session_opened(user_id, registration.live_sessions);
        self.hub.announce(user_id, transition);

        info!(
            connection_id = %self.connection_id,
            user_id = %user_id,
            live_sessions = registration.live_sessions,
            "连接已激活"
        );

        Ok(ActiveConnection {
            session: self,
            user_id,
            outbox,
            outbox_rx,
            evict,
            lease,
            write_timeout: settings.write_timeout,
            idle_timeout: settings.idle_timeout,
        })
    }

    async fn reject(&mut self, reason: CloseReason, code: ErrorCode, message: impl Into<String>) {
        self.transition(ConnectionState::Closed);
        self.hub.stats().record_connection_rejected();
        let write_timeout = self.hub.settings().write_timeout;
        let frame = ServerFrame::error(code, message);
        let _ = timeout(write_timeout, self.sink.send(&frame)).await;
        let _ = timeout(
            write_timeout,
            self.sink.close(reason.close_code(), reason.as_str()),
        )
        .await;
    }
}

/// 已注册、正在服务的连接
pub struct ActiveConnection<T: Transport> {
    session: ConnectionSession<T>,
    user_id: UserId,
    outbox: mpsc::Sender<Outbound>,
    outbox_rx: mpsc::Receiver<Outbound>,
    evict: CancellationToken,
    lease: SessionLease,
    write_timeout: Duration,
    idle_timeout: Duration,
}

impl<T: Transport> ActiveConnection<T> {
    pub fn connection_id(&self) -> ConnectionId {
        self.session.connection_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    /// 服务连接直到关闭，返回关闭原因
    pub async fn run(self) -> CloseReason {
        let ActiveConnection {
            session,
            user_id,
            outbox,
            outbox_rx,
            evict,
            lease,
            write_timeout,
            idle_timeout,
        } = self;
        let ConnectionSession {
            connection_id,
            mut state,
            hub,
            sink,
            mut source,
        } = session;

        let mut writer: JoinHandle<()> = tokio::spawn(write_loop(
            sink,
            outbox_rx,
            write_timeout,
            connection_id,
        ));
        let mut writer_done = false;

        let handler = FrameHandler {
            connection_id,
            user_id,
            hub: Arc::clone(&hub),
            outbox: outbox.clone(),
            reply_timeout: hub.settings().push_timeout,
        };

        let reason = loop {
            tokio::select! {
                biased;
                _ = evict.cancelled() => {
                    break if hub.is_shutting_down() {
                        CloseReason::Shutdown
                    } else {
                        CloseReason::Evicted
                    };
                }
                _ = &mut writer => {
                    writer_done = true;
                    break CloseReason::TransportError;
                }
                received = timeout(idle_timeout, source.receive()) => match received {
                    Err(_) => break CloseReason::IdleTimeout,
                    Ok(None) => break CloseReason::ClientClosed,
                    Ok(Some(Err(err))) => {
                        debug!(connection_id = %connection_id, error = %err, "读取失败");
                        break CloseReason::TransportError;
                    }
                    Ok(Some(Ok(Inbound::Heartbeat))) => {}
                    Ok(Some(Ok(Inbound::Unsupported))) => {
                        handler.invalid_frame("unsupported frame type").await;
                    }
                    Ok(Some(Ok(Inbound::Text(text)))) => {
                        if let Some(reason) = handler.handle_text(&text).await {
                            break reason;
                        }
                    }
                }
            }
        };
        drop(handler);

        if state.can_transition_to(ConnectionState::Closed) {
            state = ConnectionState::Closed;
        }
        lease.release(reason);
        hub.stats().record_connection_closed();
        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            reason = reason.as_str(),
            state = ?state,
            "连接已关闭"
        );

        if !writer_done {
            // 队列中已有的帧先写完，再发送关闭帧
            let _ = timeout(write_timeout, outbox.send(Outbound::Close(reason))).await;
            drop(outbox);
            if timeout(write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        reason
    }
}

async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut outbox_rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    connection_id: ConnectionId,
) {
    while let Some(outbound) = outbox_rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => match timeout(write_timeout, sink.send(&frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(connection_id = %connection_id, error = %err, "写入失败");
                    return;
                }
                Err(_) => {
                    warn!(connection_id = %connection_id, kind = frame.kind(), "写入超时");
                    return;
                }
            },
            Outbound::Close(reason) => {
                let _ = timeout(write_timeout, sink.close(reason.close_code(), reason.as_str()))
                    .await;
                return;
            }
        }
    }
    let _ = timeout(write_timeout, sink.close(CloseCode::NORMAL, "closed")).await;
}

/// 入站帧处理
struct FrameHandler {
    connection_id: ConnectionId,
    user_id: UserId,
    hub: Arc<RealtimeHub>,
    outbox: mpsc::Sender<Outbound>,
    reply_timeout: Duration,
}

impl FrameHandler {
    /// 处理一帧文本；返回 `Some` 表示连接应关闭
    async fn handle_text(&self, text: &str) -> Option<CloseReason> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.invalid_frame(&err.to_string()).await;
                return None;
            }
        };

        match frame {
            ClientFrame::Send {
                conversation_id,
                content,
                reply_to,
            } => {
                let request = SendMessageRequest {
                    conversation_id,
                    author_id: self.user_id,
                    content,
                    reply_to,
                };
                if let Err(err) = self.hub.messages().send(request).await {
                    debug!(connection_id = %self.connection_id, error = %err, "发送消息失败");
                    self.reply(ServerFrame::error(err.error_code(), err.client_message()))
                        .await;
                }
            }
            ClientFrame::Edit {
                conversation_id,
                message_id,
                content,
            } => {
                let request = EditMessageRequest {
                    conversation_id,
                    message_id,
                    author_id: self.user_id,
                    content,
                };
                if let Err(err) = self.hub.messages().edit(request).await {
                    self.reply(ServerFrame::error(err.error_code(), err.client_message()))
                        .await;
                }
            }
            ClientFrame::Delete {
                conversation_id,
                message_id,
                for_everyone,
            } => {
                let request = DeleteMessageRequest {
                    conversation_id,
                    message_id,
                    author_id: self.user_id,
                    for_everyone,
                };
                if let Err(err) = self.hub.messages().delete(request).await {
                    self.reply(ServerFrame::error(err.error_code(), err.client_message()))
                        .await;
                }
            }
            ClientFrame::MarkSeen {
                conversation_id,
                message_id,
            } => {
                if let Err(err) = self
                    .hub
                    .messages()
                    .mark_seen(self.user_id, conversation_id, message_id)
                    .await
                {
                    self.reply(ServerFrame::error(err.error_code(), err.client_message()))
                        .await;
                }
            }
            ClientFrame::Focus { conversation_id } => {
                self.hub.registry().set_focus(self.connection_id, conversation_id);
            }
            ClientFrame::Heartbeat => {}
            ClientFrame::Logout => return Some(CloseReason::Logout),
        }
        None
    }

    async fn invalid_frame(&self, detail: &str) {
        self.hub.stats().record_invalid_frame();
        warn!(connection_id = %self.connection_id, detail, "收到无效帧");
        self.reply(ServerFrame::error(ErrorCode::InvalidFrame, detail))
            .await;
    }

    async fn reply(&self, frame: ServerFrame) {
        let _ = timeout(
            self.reply_timeout,
            self.outbox.send(Outbound::Frame(Arc::new(frame))),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_only_moves_forward() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Authenticated));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Authenticated.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Authenticated));
        for next in [Connecting, Authenticated, Active, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::AuthFailed.close_code(), CloseCode::AUTH_FAILED);
        assert_eq!(
            CloseReason::DuplicateConnection.close_code(),
            CloseCode::DUPLICATE_CONNECTION
        );
        assert_eq!(CloseReason::IdleTimeout.close_code(), CloseCode::IDLE_TIMEOUT);
        assert_eq!(CloseReason::Logout.close_code(), CloseCode::NORMAL);
    }
}
