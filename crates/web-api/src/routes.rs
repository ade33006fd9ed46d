use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use application::{
    Credential, CreateGroupRequest, DeleteMessageRequest, EditMessageRequest,
    RealtimeStatsSnapshot, SeenReceipt, SendMessageRequest,
};
use domain::{
    ConnectionId, Conversation, ConversationId, MessageContent, MessageId, MessageSummary,
    PresenceState, Session, UserId,
};

use crate::{auth::bearer_token, error::ApiError, state::AppState, ws_transport::WsTransport};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CreateConversationPayload {
    Private {
        peer_id: UserId,
    },
    Group {
        name: String,
        #[serde(default)]
        members: Vec<UserId>,
    },
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    content: MessageContent,
    #[serde(default)]
    reply_to: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
struct EditMessagePayload {
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    for_everyone: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/conversations", post(create_conversation))
        .route("/conversations/{conversation_id}/leave", post(leave_conversation))
        .route("/conversations/{conversation_id}/messages", post(send_message))
        .route(
            "/conversations/{conversation_id}/messages/{message_id}",
            patch(edit_message).delete(delete_message),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/seen",
            post(mark_seen),
        )
        .route("/conversations/{conversation_id}/viewers", get(viewers))
        .route("/users/{user_id}/presence", get(presence))
        .route("/connections/{connection_id}", delete(disconnect))
        .route("/realtime/stats", get(realtime_stats))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 升级为 WebSocket 后再校验凭据，认证失败以错误帧和关闭码告知客户端
async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if state.hub.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let token = query
        .token
        .or_else(|| bearer_token(&headers).map(str::to_owned))
        .unwrap_or_default();

    ws.on_upgrade(move |socket| async move {
        let credential = Credential::new(token);
        match state.hub.on_connect(WsTransport::new(socket), credential).await {
            Ok(connection_id) => debug!(connection_id = %connection_id, "WebSocket 连接已交给实时核心"),
            Err(rejection) => debug!(error = %rejection, "WebSocket 连接被拒绝"),
        }
    })
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;

    let conversation = match payload {
        CreateConversationPayload::Private { peer_id } => {
            state.conversations.start_private(user_id, peer_id).await?
        }
        CreateConversationPayload::Group { name, members } => {
            state
                .conversations
                .create_group(CreateGroupRequest {
                    owner_id: user_id,
                    name,
                    members,
                })
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn leave_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
) -> Result<StatusCode, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    state.conversations.leave(conversation_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<MessageSummary>), ApiError> {
    let author_id = state.jwt_service.extract_user_from_headers(&headers)?;

    let summary = state
        .messages
        .send(SendMessageRequest {
            conversation_id,
            author_id,
            content: payload.content,
            reply_to: payload.reply_to,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(summary)))
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, message_id)): Path<(ConversationId, MessageId)>,
    Json(payload): Json<EditMessagePayload>,
) -> Result<Json<MessageSummary>, ApiError> {
    let author_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let summary = state
        .messages
        .edit(EditMessageRequest {
            conversation_id,
            message_id,
            author_id,
            content: payload.content,
        })
        .await?;
    Ok(Json(summary))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, message_id)): Path<(ConversationId, MessageId)>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    let author_id = state.jwt_service.extract_user_from_headers(&headers)?;
    state
        .messages
        .delete(DeleteMessageRequest {
            conversation_id,
            message_id,
            author_id,
            for_everyone: query.for_everyone,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_seen(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, message_id)): Path<(ConversationId, MessageId)>,
) -> Result<Json<SeenReceipt>, ApiError> {
    let reader = state.jwt_service.extract_user_from_headers(&headers)?;
    let receipt = state
        .messages
        .mark_seen(reader, conversation_id, message_id)
        .await?;
    Ok(Json(receipt))
}

/// 正在查看会话的连接，仅对会话有效成员可见
async fn viewers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<Vec<Session>>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    state.messages.ensure_member(conversation_id, user_id).await?;
    Ok(Json(state.hub.viewers_of(conversation_id)))
}

async fn presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
) -> Result<Json<PresenceState>, ApiError> {
    state.jwt_service.extract_user_from_headers(&headers)?;
    Ok(Json(state.hub.notify_presence_query(user_id)))
}

/// 断开调用者自己的某条连接
async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(connection_id): Path<ConnectionId>,
) -> Result<StatusCode, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let owned = state
        .hub
        .registry()
        .session(connection_id)
        .is_some_and(|session| session.user_id == user_id);
    if !owned || !state.hub.on_disconnect(connection_id) {
        return Err(ApiError::not_found("connection not found"));
    }
    info!(connection_id = %connection_id, user_id = %user_id, "连接被主动断开");
    Ok(StatusCode::NO_CONTENT)
}

async fn realtime_stats(State(state): State<AppState>) -> Json<RealtimeStatsSnapshot> {
    Json(state.hub.stats_snapshot())
}
