//! 实时连接线上帧格式
//!
//! 入站与出站帧均为带 `type` 标签的 JSON 对象。

use serde::{Deserialize, Serialize};

use crate::entities::{MessageContent, MessageSummary, PresenceState};
use crate::value_objects::{ConnectionId, ConversationId, MessageId, Timestamp, UserId};

/// 客户端发送的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 发送消息
    Send {
        conversation_id: ConversationId,
        content: MessageContent,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    /// 客户端心跳
    Heartbeat,
    /// 修改自己发送的消息
    Edit {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: MessageContent,
    },
    /// 删除自己发送的消息
    Delete {
        conversation_id: ConversationId,
        message_id: MessageId,
        #[serde(default)]
        for_everyone: bool,
    },
    /// 标记消息已读（含该消息之前的全部消息）
    MarkSeen {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// 设置/清除当前查看的会话
    Focus {
        #[serde(default)]
        conversation_id: Option<ConversationId>,
    },
    /// 主动登出
    Logout,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// 已读回执负载：读者已读到 `message_id` 为止
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: MessageId,
    pub seen_at: Timestamp,
}

/// 服务端推送的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 连接进入活跃状态
    Ready {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    /// 新消息
    Message {
        conversation_id: ConversationId,
        payload: MessageSummary,
    },
    /// 消息被作者修改
    MessageEdited {
        conversation_id: ConversationId,
        payload: MessageSummary,
    },
    /// 消息被作者删除
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        for_everyone: bool,
    },
    /// 在线状态变化
    Presence {
        user_id: UserId,
        payload: PresenceState,
    },
    /// 已读回执
    Ack {
        conversation_id: ConversationId,
        user_id: UserId,
        payload: AckPayload,
    },
    /// 错误通知
    Error { code: ErrorCode, message: String },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// 帧类型名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Message { .. } => "message",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::Presence { .. } => "presence",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// 错误帧代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    DuplicateConnection,
    InvalidFrame,
    NotAMember,
    ValidationFailed,
    NotFound,
    Internal,
}

/// WebSocket 关闭码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
    pub const AUTH_FAILED: CloseCode = CloseCode(4401);
    pub const IDLE_TIMEOUT: CloseCode = CloseCode(4408);
    pub const DUPLICATE_CONNECTION: CloseCode = CloseCode(4409);
    pub const EVICTED: CloseCode = CloseCode(4410);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn parses_send_frame_with_tagged_content() {
        let conversation_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"send","conversation_id":"{}","content":{{"kind":"text","text":"hi"}}}}"#,
            conversation_id
        );
        let frame = ClientFrame::parse(&raw).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Send {
                conversation_id: ConversationId::from(conversation_id),
                content: MessageContent::text("hi"),
                reply_to: None,
            }
        );
    }

    #[test]
    fn heartbeat_and_unknown_types() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientFrame::Heartbeat
        );
        assert!(ClientFrame::parse(r#"{"type":"dance"}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn delete_frame_defaults_to_author_only() {
        let conversation_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"delete","conversation_id":"{conversation_id}","message_id":"{message_id}"}}"#
        );
        assert_eq!(
            ClientFrame::parse(&raw).unwrap(),
            ClientFrame::Delete {
                conversation_id: ConversationId::from(conversation_id),
                message_id: MessageId::from(message_id),
                for_everyone: false,
            }
        );

        let frame = ServerFrame::MessageDeleted {
            conversation_id: ConversationId::from(conversation_id),
            message_id: MessageId::from(message_id),
            for_everyone: true,
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "message_deleted");
        assert_eq!(value["for_everyone"], true);
    }

    #[test]
    fn presence_frame_shape() {
        let user_id = UserId::from(Uuid::new_v4());
        let frame = ServerFrame::Presence {
            user_id,
            payload: PresenceState {
                user_id,
                online: true,
                last_seen: None,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "presence");
        assert_eq!(value["user_id"], user_id.to_string());
        assert_eq!(value["payload"]["online"], true);
    }

    #[test]
    fn error_codes_are_screaming_snake_case() {
        let frame = ServerFrame::error(ErrorCode::NotAMember, "nope");
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["code"], "NOT_A_MEMBER");
    }
}
