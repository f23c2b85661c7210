use serde::{Deserialize, Serialize};

use crate::value_objects::{DisplayName, PasswordHash, Timestamp, UserEmail, UserId};

/// 身份记录。注册后在本系统范围内不可变。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: UserEmail,
    pub name: DisplayName,
    pub password: PasswordHash,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl User {
    pub fn register(
        id: UserId,
        email: UserEmail,
        name: Option<DisplayName>,
        password: PasswordHash,
        now: Timestamp,
    ) -> Self {
        let name = name.unwrap_or_else(|| DisplayName::from_email(&email));
        Self {
            id,
            email,
            name,
            password,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile::from(self)
    }
}

/// 对外公开的用户资料，永远不包含密码凭据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: DisplayName,
    pub email: UserEmail,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        }
    }
}
