//! 集成测试共用的装配工具

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::memory::{ChannelClient, ChannelTransport, InMemoryConversationRepository, InMemoryMessageRepository};
use application::{
    AuthFailure, Authenticator, Credential, LocalOnlyBackend, RealtimeCore,
    RealtimeCoreDependencies, RealtimeSettings, Rejection, SystemClock,
};
use async_trait::async_trait;
use domain::{ConnectionId, NodeId, ServerFrame, UserId};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(2);

/// token 即用户ID
pub struct UuidTokenAuthenticator;

#[async_trait]
impl Authenticator for UuidTokenAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> Result<UserId, AuthFailure> {
        Uuid::parse_str(credential.as_str())
            .map(UserId::from)
            .map_err(|_| AuthFailure::InvalidCredential)
    }
}

pub struct Harness {
    pub core: RealtimeCore,
    pub conversations: Arc<InMemoryConversationRepository>,
    pub messages: Arc<InMemoryMessageRepository>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(RealtimeSettings {
            outbox_capacity: 64,
            push_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_settings(settings: RealtimeSettings) -> Self {
        let conversations = Arc::new(InMemoryConversationRepository::new());
        let messages = Arc::new(InMemoryMessageRepository::new());
        let core = RealtimeCore::assemble(RealtimeCoreDependencies {
            conversations: conversations.clone(),
            messages: messages.clone(),
            authenticator: Arc::new(UuidTokenAuthenticator),
            backend: Arc::new(LocalOnlyBackend),
            clock: Arc::new(SystemClock),
            settings,
            node_id: NodeId::generate(),
        });
        Self {
            core,
            conversations,
            messages,
        }
    }

    /// 建立连接并读掉 ready 帧
    pub async fn connect(&self, user_id: UserId) -> (ConnectionId, ChannelClient) {
        let (transport, mut client) = ChannelTransport::pair();
        let connection_id = self
            .core
            .hub
            .on_connect(transport, Credential::new(user_id.to_string()))
            .await
            .expect("connect");
        match client.next_frame(WAIT).await {
            Some(ServerFrame::Ready { .. }) => {}
            other => panic!("expected ready frame, got {other:?}"),
        }
        (connection_id, client)
    }

    pub async fn try_connect_as(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> (Result<ConnectionId, Rejection>, ChannelClient) {
        let (transport, client) = ChannelTransport::pair();
        let result = self
            .core
            .hub
            .connect_as(connection_id, transport, Credential::new(user_id.to_string()))
            .await;
        (result, client)
    }

    /// 等待注册表满足条件
    pub async fn eventually(&self, mut check: impl FnMut(&RealtimeCore) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.core) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

/// 收集客户端在短时间内收到的全部推送帧
pub async fn drain(client: &mut ChannelClient, quiet: Duration) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = client.next_frame(quiet).await {
        frames.push(frame);
    }
    frames
}
