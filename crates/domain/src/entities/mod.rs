//! 领域实体定义
//!
//! 包含系统的核心实体：会话、会话成员、消息、连接会话与在线状态。

pub mod conversation;
pub mod message;
pub mod session;

// 重新导出核心实体
pub use conversation::{Conversation, ConversationKind, ConversationMember};
pub use message::{
    MessageContent, MessageDeletion, MessageEdit, MessageEnvelope, MessageSummary, NewMessage,
    ReplyPreview,
};
pub use session::{PresenceState, PresenceTransition, Session};
