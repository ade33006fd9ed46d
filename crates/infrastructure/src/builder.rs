use std::sync::Arc;

use application::{FanoutBackend, LocalOnlyBackend};
use config::{BroadcastBackend, BroadcastConfig, DatabaseConfig};
use thiserror::Error;
use tracing::info;

use crate::{
    migrations::MIGRATOR,
    redis_fanout::RedisFanoutBackend,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
}

impl Infrastructure {
    /// 连接数据库并执行迁移
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        info!(max_connections = config.max_connections, "数据库已连接，迁移完成");

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
        })
    }
}

/// 按配置创建扇出后端；Redis 后端同时返回用于订阅的客户端
pub async fn fanout_backend(
    config: &BroadcastConfig,
) -> Result<(Arc<dyn FanoutBackend>, Option<redis::Client>), InfrastructureError> {
    match config.backend {
        BroadcastBackend::Local => Ok((Arc::new(LocalOnlyBackend), None)),
        BroadcastBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                InfrastructureError::Config("broadcast.redis_url is required".to_string())
            })?;
            let client = redis::Client::open(url)?;
            let backend = RedisFanoutBackend::connect(client.clone(), config.channel.clone()).await?;
            info!(channel = %config.channel, "使用 Redis 跨进程扇出");
            Ok((Arc::new(backend), Some(client)))
        }
    }
}
