//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 升级后把连接交给实时核心，
//! REST 端点委托给应用层的会话与消息服务。

mod auth;
mod error;
mod routes;
mod state;
mod ws_transport;

pub use auth::{Claims, JwtAuthenticator, JwtService};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
pub use ws_transport::WsTransport;
