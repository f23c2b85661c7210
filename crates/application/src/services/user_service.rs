use std::sync::Arc;

use domain::{
    DisplayName, DomainError, RepositoryError, User, UserEmail, UserId, UserProfile,
    UserRepository,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::{PasswordHasher, Principal, TokenService},
    clock::Clock,
    error::ApplicationError,
};

#[derive(Debug, Clone)]
pub struct RegisterUserRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub struct UserServiceDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub password_hasher: Arc<dyn PasswordHasher>,
    pub token_service: Arc<dyn TokenService>,
    pub clock: Arc<dyn Clock>,
}

pub struct UserService {
    deps: UserServiceDependencies,
}

impl UserService {
    pub fn new(deps: UserServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn register(
        &self,
        request: RegisterUserRequest,
    ) -> Result<UserProfile, ApplicationError> {
        let email = UserEmail::parse(request.email)?;
        if request.password.is_empty() {
            return Err(DomainError::invalid_argument("password", "cannot be empty").into());
        }
        // 空白名称视为未提供
        let name = request
            .name
            .filter(|name| !name.trim().is_empty())
            .map(DisplayName::parse)
            .transpose()?;

        if self
            .deps
            .user_repository
            .find_by_email(email.clone())
            .await?
            .is_some()
        {
            return Err(ApplicationError::Domain(DomainError::UserAlreadyExists));
        }

        let password_hash = self.deps.password_hasher.hash(&request.password).await?;
        let user = User::register(
            UserId::from(Uuid::new_v4()),
            email,
            name,
            password_hash,
            self.deps.clock.now(),
        );

        let stored = match self.deps.user_repository.create(user).await {
            Ok(stored) => stored,
            Err(RepositoryError::Conflict) => {
                return Err(ApplicationError::Domain(DomainError::UserAlreadyExists))
            }
            Err(err) => return Err(err.into()),
        };
        info!(user_id = %stored.id, "user registered");
        Ok(stored.profile())
    }

    /// 账号不存在与密码错误返回同一个错误。
    pub async fn login(
        &self,
        request: LoginRequest,
    ) -> Result<(UserProfile, String), ApplicationError> {
        let email =
            UserEmail::parse(request.email).map_err(|_| ApplicationError::InvalidCredential)?;
        let user = self
            .deps
            .user_repository
            .find_by_email(email)
            .await?
            .ok_or(ApplicationError::InvalidCredential)?;

        let password_ok = self
            .deps
            .password_hasher
            .verify(&request.password, &user.password)
            .await?;
        if !password_ok {
            return Err(ApplicationError::InvalidCredential);
        }

        let token = self.deps.token_service.issue(user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok((user.profile(), token))
    }

    pub async fn current_user(&self, principal: Principal) -> Result<UserProfile, ApplicationError> {
        let user = self
            .deps
            .user_repository
            .find_by_id(principal.user_id)
            .await?
            .ok_or(DomainError::UserNotFound)?;
        Ok(user.profile())
    }

    pub async fn list_users(&self) -> Result<Vec<UserProfile>, ApplicationError> {
        let users = self.deps.user_repository.list_profiles().await?;
        Ok(users)
    }
}
