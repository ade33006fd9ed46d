//! Redis Pub/Sub 跨进程扇出
//!
//! 所有节点发布到同一个频道；每个节点的订阅任务收到事件后，
//! 忽略自己发出的事件，其余只投递给本地连接。

use std::sync::Arc;
use std::time::Duration;

use application::{BroadcastError, FanoutBackend, MessageDispatcher, RemoteDispatch};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 订阅断开后的重连间隔
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisFanoutBackend {
    connection: ConnectionManager,
    channel: String,
}

impl RedisFanoutBackend {
    pub async fn connect(client: Client, channel: impl Into<String>) -> redis::RedisResult<Self> {
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl FanoutBackend for RedisFanoutBackend {
    async fn publish(&self, dispatch: RemoteDispatch) -> Result<(), BroadcastError> {
        let payload =
            serde_json::to_string(&dispatch).map_err(|err| BroadcastError::failed(err.to_string()))?;
        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(&self.channel, payload)
            .await
            .map_err(|err| BroadcastError::failed(err.to_string()))?;
        debug!(channel = %self.channel, receivers, kind = dispatch.frame.kind(), "扇出事件已发布");
        Ok(())
    }
}

/// 启动订阅任务，直到 `shutdown` 被取消
pub fn spawn_fanout_subscriber(
    client: Client,
    channel: String,
    dispatcher: Arc<MessageDispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(channel = %channel, node_id = %dispatcher.node_id(), "启动扇出订阅");
        loop {
            match subscribe_once(&client, &channel, &dispatcher, &shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    error!(channel = %channel, error = %err, "扇出订阅中断，稍后重连");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                }
            }
        }
        info!(channel = %channel, "扇出订阅已停止");
    })
}

async fn subscribe_once(
    client: &Client,
    channel: &str,
    dispatcher: &MessageDispatcher,
    shutdown: &CancellationToken,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    let mut messages = pubsub.on_message();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = messages.next() => {
                let Some(message) = message else {
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pubsub stream closed",
                    )));
                };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "无法读取扇出事件负载");
                        continue;
                    }
                };
                match serde_json::from_str::<RemoteDispatch>(&payload) {
                    // 逐条投递，保持发布顺序
                    Ok(dispatch) => {
                        dispatcher.deliver_remote(dispatch).await;
                    }
                    Err(err) => warn!(error = %err, "无法解析扇出事件"),
                }
            }
        }
    }
}
