//! 私信系统核心领域模型
//!
//! 包含用户、会话、消息等核心实体，以及数据访问契约。

pub mod chat;
pub mod errors;
pub mod message;
pub mod repository;
pub mod user;
pub mod value_objects;

pub use chat::{Chat, ChatDetails, ChatPair, ChatSide};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use message::Message;
pub use repository::{
    ChatRepository, MessageRepository, RepositoryFuture, RepositoryResult, UserRepository,
};
pub use user::{User, UserProfile};
pub use value_objects::{
    ChatId, DisplayName, MessageContent, MessageId, PasswordHash, Timestamp, UserEmail, UserId,
};
