use std::sync::Arc;

use application::{ConversationService, MessageService, RealtimeCore, RealtimeHub};

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RealtimeHub>,
    pub messages: Arc<MessageService>,
    pub conversations: Arc<ConversationService>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(core: &RealtimeCore, jwt_service: Arc<JwtService>) -> Self {
        Self {
            hub: Arc::clone(&core.hub),
            messages: Arc::clone(&core.messages),
            conversations: Arc::clone(&core.conversations),
            jwt_service,
        }
    }
}
