//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储与 Redis 跨进程扇出，实现应用/领域层定义的接口。

pub mod builder;
pub mod migrations;
pub mod redis_fanout;
pub mod repository;

pub use builder::{fanout_backend, Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use redis_fanout::{spawn_fanout_subscriber, RedisFanoutBackend};
pub use repository::{
    create_pg_pool, PgConversationRepository, PgMessageRepository, PgStorage,
};
