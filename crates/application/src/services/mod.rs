mod conversation;
mod user_service;

pub use conversation::{ConversationEngine, ConversationEngineDependencies, EventOrigin};
pub use user_service::{LoginRequest, RegisterUserRequest, UserService, UserServiceDependencies};
