//! 应用层实现。
//!
//! 实时扇出核心：会话注册表、在线状态、成员解析、按会话有序的扇出调度、
//! 连接生命周期，以及围绕它们的消息与会话用例服务。
//! 传输层、认证和存储都通过 trait 抽象，由外层适配。

pub mod assembly;
pub mod auth;
pub mod broadcaster;
pub mod clock;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod membership;
pub mod memory;
pub mod ordering;
pub mod presence;
pub mod registry;
pub mod services;
pub mod stats;
pub mod transport;

pub use assembly::{RealtimeCore, RealtimeCoreDependencies};
pub use auth::{AuthFailure, Authenticator, Credential};
pub use broadcaster::{BroadcastError, FanoutBackend, LocalOnlyBackend, RemoteDispatch};
pub use clock::{Clock, SystemClock};
pub use connection::{ActiveConnection, CloseReason, ConnectionSession, ConnectionState};
pub use dispatcher::{DispatchError, DispatchReport, MessageDispatcher};
pub use error::ApplicationError;
pub use hub::{RealtimeHub, RealtimeSettings, Rejection};
pub use membership::{MembershipResolver, ResolveError};
pub use presence::PresenceTracker;
pub use registry::{PushTarget, RegistryError, SessionRegistry};
pub use services::{
    ConversationService, CreateGroupRequest, DeleteMessageRequest, EditMessageRequest,
    MessageService, SeenReceipt, SendMessageRequest,
};
pub use stats::{RealtimeStats, RealtimeStatsSnapshot};
pub use transport::{FrameSink, FrameSource, Inbound, Outbound, Transport, TransportError};
