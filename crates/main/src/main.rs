//! 主应用程序入口
//!
//! 加载配置、连接存储、装配实时核心并启动 Axum 服务；
//! 收到 Ctrl+C 后停止接受请求，关闭全部实时连接再退出。

use std::sync::Arc;

use anyhow::Context;
use application::{RealtimeCore, RealtimeCoreDependencies, RealtimeSettings, SystemClock};
use config::AppConfig;
use domain::NodeId;
use infrastructure::{fanout_backend, spawn_fanout_subscriber, Infrastructure};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtAuthenticator, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，未设置 RUST_LOG 时默认 info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("加载配置失败")?;

    let infrastructure = Infrastructure::connect(&config.database)
        .await
        .context("连接数据库失败")?;
    let (backend, redis_client) = fanout_backend(&config.broadcast)
        .await
        .context("创建扇出后端失败")?;

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let node_id = NodeId::generate();
    let storage = &infrastructure.storage;

    let core = RealtimeCore::assemble(RealtimeCoreDependencies {
        conversations: storage.conversation_repository.clone(),
        messages: storage.message_repository.clone(),
        authenticator: Arc::new(JwtAuthenticator::new(Arc::clone(&jwt_service))),
        backend,
        clock: Arc::new(SystemClock),
        settings: RealtimeSettings::from(&config.realtime),
        node_id,
    });

    let subscriber_shutdown = CancellationToken::new();
    let subscriber = redis_client.map(|client| {
        spawn_fanout_subscriber(
            client,
            config.broadcast.channel.clone(),
            Arc::clone(&core.dispatcher),
            subscriber_shutdown.clone(),
        )
    });

    let app = router(AppState::new(&core, jwt_service));
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("监听 {address} 失败"))?;

    tracing::info!(address = %address, node_id = %node_id, "聊天服务器已启动");

    // 先关闭实时连接，再停止 HTTP 服务
    let hub = Arc::clone(&core.hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "监听退出信号失败");
            }
            tracing::info!("收到退出信号，开始关闭");
            hub.shutdown().await;
        })
        .await?;

    subscriber_shutdown.cancel();
    if let Some(handle) = subscriber {
        let _ = handle.await;
    }

    tracing::info!("聊天服务器已退出");
    Ok(())
}
