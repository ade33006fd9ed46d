mod conversation_service;
mod message_service;

pub use conversation_service::{
    ConversationService, ConversationServiceDependencies, CreateGroupRequest,
};
pub use message_service::{
    DeleteMessageRequest, EditMessageRequest, MessageService, MessageServiceDependencies,
    SeenReceipt, SendMessageRequest,
};
