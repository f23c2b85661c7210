//! 应用层实现。
//!
//! 围绕领域模型的用例服务：会话引擎、用户服务、在线状态与连接中心，
//! 以及对外部适配器（密码哈希、令牌、事件推送）的抽象。

pub mod auth;
pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod events;
pub mod hub;
pub mod memory;
pub mod presence;
pub mod services;

pub use auth::{Claims, PasswordHasher, PasswordHasherError, Principal, TokenError, TokenService};
pub use broadcaster::{BroadcastError, EventBroadcaster};
pub use clock::{Clock, SteppingClock, SystemClock};
pub use error::ApplicationError;
pub use events::{ClientEvent, ServerEvent};
pub use hub::{ConnectionHandle, ConnectionHub};
pub use memory::MemoryStorage;
pub use presence::{ConnectionId, PresenceRegistry, PresenceTransition};
pub use services::{
    ConversationEngine, ConversationEngineDependencies, EventOrigin, LoginRequest,
    RegisterUserRequest, UserService, UserServiceDependencies,
};
