//! 端到端测试共用工具：进程内启动 HTTP/WebSocket 服务，存储使用内存实现

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::memory::{InMemoryConversationRepository, InMemoryMessageRepository};
use application::{
    LocalOnlyBackend, RealtimeCore, RealtimeCoreDependencies, RealtimeSettings, SystemClock,
};
use domain::{NodeId, UserId};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState, JwtAuthenticator, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub base_http: String,
    pub base_ws: String,
    pub core: RealtimeCore,
    pub jwt: Arc<JwtService>,
    pub http: reqwest::Client,
}

impl TestServer {
    pub async fn start() -> Self {
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "end-to-end-test-secret-key-0123456789".to_string(),
            expiration_hours: 1,
        }));

        let core = RealtimeCore::assemble(RealtimeCoreDependencies {
            conversations: Arc::new(InMemoryConversationRepository::new()),
            messages: Arc::new(InMemoryMessageRepository::new()),
            authenticator: Arc::new(JwtAuthenticator::new(Arc::clone(&jwt))),
            backend: Arc::new(LocalOnlyBackend),
            clock: Arc::new(SystemClock),
            settings: RealtimeSettings {
                outbox_capacity: 64,
                push_timeout: Duration::from_millis(500),
                write_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_secs(30),
            },
            node_id: NodeId::generate(),
        });

        let app = router(AppState::new(&core, Arc::clone(&jwt)));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.ok();
        });

        Self {
            base_http: format!("http://{addr}"),
            base_ws: format!("ws://{addr}"),
            core,
            jwt,
            http: reqwest::Client::new(),
        }
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_http, path)
    }

    pub async fn connect_ws(&self, token: &str) -> WsClient {
        let url = format!("{}/api/v1/ws?token={}", self.base_ws, token);
        let (socket, _) = connect_async(url).await.expect("ws connect");
        socket
    }

    /// 连接并读掉 ready 帧
    pub async fn connect_ready(&self, user_id: UserId) -> WsClient {
        let mut socket = self.connect_ws(&self.token(user_id)).await;
        let ready = next_json(&mut socket, WAIT).await.expect("ready frame");
        assert_eq!(ready["type"], "ready");
        assert_eq!(ready["user_id"], user_id.to_string());
        socket
    }

    pub async fn post_json(
        &self,
        path: &str,
        user_id: UserId,
        body: &Value,
    ) -> reqwest::Response {
        self.http
            .post(self.url(path))
            .bearer_auth(self.token(user_id))
            .json(body)
            .send()
            .await
            .expect("http request")
    }

    pub async fn get_json(&self, path: &str, user_id: UserId) -> Value {
        self.http
            .get(self.url(path))
            .bearer_auth(self.token(user_id))
            .send()
            .await
            .expect("http request")
            .json::<Value>()
            .await
            .expect("json body")
    }

    pub async fn eventually(&self, mut check: impl FnMut(&RealtimeCore) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.core) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

/// 读取下一个 JSON 文本帧；超时或连接关闭时返回 None
pub async fn next_json(socket: &mut WsClient, wait: Duration) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(wait, socket.next()).await.ok()??.ok()?;
        match message {
            TungsteniteMessage::Text(text) => {
                return serde_json::from_str(text.as_str()).ok();
            }
            TungsteniteMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

/// 跳过其他类型，读取下一个指定类型的帧
pub async fn next_of_type(socket: &mut WsClient, kind: &str) -> Option<Value> {
    loop {
        let frame = next_json(socket, WAIT).await?;
        if frame["type"] == kind {
            return Some(frame);
        }
    }
}

/// 读取直到收到关闭帧，返回关闭码
pub async fn close_code(socket: &mut WsClient) -> Option<u16> {
    loop {
        let message = tokio::time::timeout(WAIT, socket.next()).await.ok()??.ok()?;
        if let TungsteniteMessage::Close(frame) = message {
            return frame.map(|frame| u16::from(frame.code));
        }
    }
}
