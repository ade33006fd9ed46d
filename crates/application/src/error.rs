use domain::{ConversationId, DomainError, ErrorCode, MessageId, RepositoryError, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("user {user_id} is not a member of conversation {conversation_id}")]
    NotAMember {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

impl ApplicationError {
    /// 推送给客户端的错误帧代码
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ApplicationError::Domain(DomainError::ValidationError { .. }) => {
                ErrorCode::ValidationFailed
            }
            ApplicationError::NotAMember { .. } => ErrorCode::NotAMember,
            ApplicationError::ConversationNotFound(_)
            | ApplicationError::MessageNotFound(_)
            | ApplicationError::Repository(RepositoryError::NotFound) => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }

    /// 可以原样返回给客户端的描述；内部错误只返回概括信息
    pub fn client_message(&self) -> String {
        match self.error_code() {
            ErrorCode::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
