use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::ErrorCode;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        let message = error.client_message();
        match error.error_code() {
            ErrorCode::ValidationFailed => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
            }
            ErrorCode::NotAMember => ApiError::new(StatusCode::FORBIDDEN, "NOT_A_MEMBER", message),
            ErrorCode::NotFound => ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            _ => {
                error!(error = %error, "请求处理失败");
                ApiError::internal_server_error(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ConversationId, DomainError, RepositoryError, UserId};
    use uuid::Uuid;

    #[test]
    fn maps_application_errors_to_status() {
        let not_member = ApplicationError::NotAMember {
            conversation_id: ConversationId::from(Uuid::new_v4()),
            user_id: UserId::from(Uuid::new_v4()),
        };
        assert_eq!(ApiError::from(not_member).status(), StatusCode::FORBIDDEN);

        let invalid = ApplicationError::from(DomainError::validation_error("text", "empty"));
        assert_eq!(ApiError::from(invalid).status(), StatusCode::BAD_REQUEST);

        let missing = ApplicationError::ConversationNotFound(ConversationId::from(Uuid::new_v4()));
        assert_eq!(ApiError::from(missing).status(), StatusCode::NOT_FOUND);

        let storage = ApiError::from(ApplicationError::from(RepositoryError::storage("down")));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(storage.body.message, "internal error");
    }
}
