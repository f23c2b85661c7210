use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::auth::{PasswordHasherError, TokenError};

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("password error: {0}")]
    Password(#[from] PasswordHasherError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    /// 请求或连接未携带凭据
    #[error("authentication required")]
    Unauthenticated,
    /// 凭据校验失败（签名、过期或账号密码错误）
    #[error("invalid credential")]
    InvalidCredential,
    /// 已认证但无权操作目标资源
    #[error("operation not allowed")]
    Forbidden,
}

impl ApplicationError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ApplicationError::Domain(
                DomainError::UserNotFound | DomainError::ChatNotFound | DomainError::MessageNotFound
            ) | ApplicationError::Repository(RepositoryError::NotFound)
        )
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
