use std::sync::Arc;

use application::{MemoryStorage, PasswordHasher, TokenService};
use config::AppConfig;
use domain::{ChatRepository, MessageRepository, UserRepository};
use thiserror::Error;
use tracing::info;

use crate::{
    auth::JwtTokenService,
    migrations::MIGRATOR,
    password::BcryptPasswordHasher,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// 装配好的外部适配器集合，供 web 层组装服务使用。
#[derive(Clone)]
pub struct Infrastructure {
    pub user_repository: Arc<dyn UserRepository>,
    pub chat_repository: Arc<dyn ChatRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub password_hasher: Arc<dyn PasswordHasher>,
    pub token_service: Arc<dyn TokenService>,
}

impl Infrastructure {
    /// 按配置选择存储：`database.in_memory` 为真时不连接数据库。
    pub async fn from_config(config: &AppConfig) -> Result<Self, InfrastructureError> {
        if config.database.in_memory {
            Ok(Self::in_memory(config))
        } else {
            Self::connect(config).await
        }
    }

    /// 连接 PostgreSQL 并执行迁移。
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        info!(max_connections = config.database.max_connections, "postgres storage ready");

        let storage = PgStorage::new(pool);
        Ok(Self {
            user_repository: storage.user_repository,
            chat_repository: storage.chat_repository,
            message_repository: storage.message_repository,
            password_hasher: Arc::new(BcryptPasswordHasher::from_config(&config.security)),
            token_service: Arc::new(JwtTokenService::new(&config.jwt)),
        })
    }

    pub fn in_memory(config: &AppConfig) -> Self {
        info!("using in-memory storage");
        let storage = MemoryStorage::new();
        Self {
            user_repository: Arc::new(storage.clone()),
            chat_repository: Arc::new(storage.clone()),
            message_repository: Arc::new(storage),
            password_hasher: Arc::new(BcryptPasswordHasher::from_config(&config.security)),
            token_service: Arc::new(JwtTokenService::new(&config.jwt)),
        }
    }
}
