//! 消息实体定义
//!
//! 消息内容在边界处一次性解析为带标签的枚举（文本/图片/视频），
//! 并携带统一的信封（作者、会话、回复目标）。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 文本消息最大长度（字符）
pub const MAX_TEXT_LENGTH: usize = 4000;
/// 图片/视频说明最大长度（字符）
pub const MAX_CAPTION_LENGTH: usize = 1024;
/// 预览最大长度（字符）
pub const PREVIEW_LENGTH: usize = 100;

/// 消息内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// 文本消息
    Text { text: String },
    /// 图片消息
    Photo {
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// 视频消息
    Video {
        video_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// 内容类型名称（用于日志与存储）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Photo { .. } => "photo",
            Self::Video { .. } => "video",
        }
    }

    /// 校验消息内容
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            Self::Text { text } => {
                if text.trim().is_empty() {
                    return Err(DomainError::validation_error("text", "消息内容不能为空"));
                }
                if text.chars().count() > MAX_TEXT_LENGTH {
                    return Err(DomainError::validation_error("text", "消息内容过长"));
                }
            }
            Self::Photo {
                image_url: url,
                caption,
            }
            | Self::Video {
                video_url: url,
                caption,
            } => {
                if url.trim().is_empty() {
                    return Err(DomainError::validation_error("url", "媒体地址不能为空"));
                }
                if caption
                    .as_ref()
                    .is_some_and(|c| c.chars().count() > MAX_CAPTION_LENGTH)
                {
                    return Err(DomainError::validation_error("caption", "说明文字过长"));
                }
            }
        }
        Ok(())
    }

    /// 生成简短预览：文本本身，或说明文字，或媒体文件名
    pub fn preview(&self) -> String {
        let raw = match self {
            Self::Text { text } => text.as_str(),
            Self::Photo {
                image_url: url,
                caption,
            }
            | Self::Video {
                video_url: url,
                caption,
            } => match caption.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(caption) => caption,
                None => url.rsplit('/').next().unwrap_or(url.as_str()),
            },
        };
        raw.chars().take(PREVIEW_LENGTH).collect()
    }
}

/// 所有消息类型共享的信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub author_id: UserId,
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// 待持久化的新消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub envelope: MessageEnvelope,
    pub content: MessageContent,
    pub created_at: Timestamp,
}

/// 作者修改消息内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEdit {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub content: MessageContent,
    pub edited_at: Timestamp,
}

/// 作者删除消息；`for_everyone` 为 false 时只对作者本人隐藏
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeletion {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub for_everyone: bool,
    pub deleted_at: Timestamp,
}

/// 被回复消息的预览
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub preview: String,
}

/// 已持久化消息的摘要，作为扇出负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: MessageId,
    #[serde(flatten)]
    pub envelope: MessageEnvelope,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_preview: Option<ReplyPreview>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub edited_at: Option<Timestamp>,
    /// 已读过该消息的用户（不含作者）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seen_by: Vec<UserId>,
}

impl MessageSummary {
    pub fn conversation_id(&self) -> ConversationId {
        self.envelope.conversation_id
    }

    pub fn author_id(&self) -> UserId {
        self.envelope.author_id
    }

    pub fn preview(&self) -> String {
        self.content.preview()
    }

    pub fn is_seen_by(&self, user_id: UserId) -> bool {
        self.seen_by.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_tagged_by_kind() {
        let content: MessageContent = serde_json::from_str(
            r#"{"kind":"photo","image_url":"https://cdn.example.com/images/cat.png"}"#,
        )
        .unwrap();
        assert_eq!(content.kind(), "photo");
        assert_eq!(content.preview(), "cat.png");

        let unknown = serde_json::from_str::<MessageContent>(r#"{"kind":"audio","url":"x"}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn caption_wins_over_file_name_in_preview() {
        let content = MessageContent::Video {
            video_url: "https://cdn.example.com/v/clip.mp4".into(),
            caption: Some("holiday".into()),
        };
        assert_eq!(content.preview(), "holiday");
    }

    #[test]
    fn empty_and_oversized_text_is_rejected() {
        assert!(MessageContent::text("  ").validate().is_err());
        assert!(MessageContent::text("x".repeat(MAX_TEXT_LENGTH + 1))
            .validate()
            .is_err());
        assert!(MessageContent::text("hello").validate().is_ok());
    }

    #[test]
    fn preview_is_truncated() {
        let content = MessageContent::text("a".repeat(500));
        assert_eq!(content.preview().chars().count(), PREVIEW_LENGTH);
    }
}
