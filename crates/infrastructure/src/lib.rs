//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储、密码哈希、JWT 令牌等适配器，实现应用/领域层定义的接口。

pub mod auth;
pub mod builder;
pub mod migrations;
pub mod password;
pub mod repository;

pub use auth::JwtTokenService;
pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use password::BcryptPasswordHasher;
pub use repository::{
    create_pg_pool, PgChatRepository, PgMessageRepository, PgStorage, PgUserRepository,
};
