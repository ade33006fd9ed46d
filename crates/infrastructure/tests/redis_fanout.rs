use std::sync::Arc;
use std::time::Duration;

use application::memory::{
    ChannelTransport, InMemoryConversationRepository, InMemoryMessageRepository,
    StaticTokenAuthenticator,
};
use application::{
    Credential, RealtimeCore, RealtimeCoreDependencies, RealtimeSettings, SendMessageRequest,
    SystemClock,
};
use domain::{MessageContent, NodeId, ServerFrame, UserId};
use infrastructure::{spawn_fanout_subscriber, RedisFanoutBackend};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 两个节点共享会话存储和 Redis 频道：A 节点发送，B 节点上的连接收到消息
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn message_crosses_nodes() {
    let node = Redis::default().start().await.expect("start redis");
    let port = node.get_host_port_ipv4(6379u16).await.expect("port");
    let url = format!("redis://127.0.0.1:{port}");

    let conversations = Arc::new(InMemoryConversationRepository::new());
    let messages = Arc::new(InMemoryMessageRepository::new());
    let alice = UserId::from(Uuid::new_v4());
    let bob = UserId::from(Uuid::new_v4());
    let conversation = conversations.insert_group("cross", &[alice, bob]).await;
    let authenticator = Arc::new(StaticTokenAuthenticator::new().with_token("bob", bob));
    let shutdown = CancellationToken::new();

    let mut cores = Vec::new();
    for _ in 0..2 {
        let client = redis::Client::open(url.as_str()).expect("client");
        let backend = RedisFanoutBackend::connect(client.clone(), "chat:fanout:test")
            .await
            .expect("backend");
        let core = RealtimeCore::assemble(RealtimeCoreDependencies {
            conversations: conversations.clone(),
            messages: messages.clone(),
            authenticator: authenticator.clone(),
            backend: Arc::new(backend),
            clock: Arc::new(SystemClock),
            settings: RealtimeSettings::default(),
            node_id: NodeId::generate(),
        });
        spawn_fanout_subscriber(
            client,
            "chat:fanout:test".to_string(),
            core.dispatcher.clone(),
            shutdown.clone(),
        );
        cores.push(core);
    }
    // 等待订阅建立
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (transport, mut bob_client) = ChannelTransport::pair();
    cores[1]
        .hub
        .on_connect(transport, Credential::new("bob"))
        .await
        .expect("bob connects to node B");
    assert!(matches!(
        bob_client.next_frame(Duration::from_secs(2)).await,
        Some(ServerFrame::Ready { .. })
    ));

    let sent = cores[0]
        .messages
        .send(SendMessageRequest {
            conversation_id: conversation,
            author_id: alice,
            content: MessageContent::text("across the wire"),
            reply_to: None,
        })
        .await
        .expect("send on node A");

    let received = loop {
        match bob_client.next_frame(Duration::from_secs(3)).await {
            Some(ServerFrame::Message { payload, .. }) => break payload,
            Some(_) => continue,
            None => panic!("message did not reach node B"),
        }
    };
    assert_eq!(received.id, sent.id);
    shutdown.cancel();
}
