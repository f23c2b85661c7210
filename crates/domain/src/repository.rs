//! 数据访问契约。
//!
//! 只做查询组织，不含业务规则。所有返回会话的操作都带上有序消息集合
//! 与双方公开资料，永远不返回密码凭据。

use futures::future::BoxFuture;

use crate::chat::{Chat, ChatDetails, ChatSide};
use crate::errors::RepositoryError;
use crate::message::Message;
use crate::user::{User, UserProfile};
use crate::value_objects::{ChatId, MessageContent, MessageId, Timestamp, UserEmail, UserId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type RepositoryFuture<T> = BoxFuture<'static, RepositoryResult<T>>;

pub trait UserRepository: Send + Sync {
    /// 邮箱重复时返回 `RepositoryError::Conflict`。
    fn create(&self, user: User) -> RepositoryFuture<User>;
    fn find_by_id(&self, id: UserId) -> RepositoryFuture<Option<User>>;
    fn find_by_email(&self, email: UserEmail) -> RepositoryFuture<Option<User>>;
    fn list_profiles(&self) -> RepositoryFuture<Vec<UserProfile>>;
}

pub trait ChatRepository: Send + Sync {
    /// 该用户可见（本侧未删除）的会话，按 `updated_at` 倒序。
    fn find_all_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<ChatDetails>>;

    /// 不过滤删除标记。
    fn find_by_id(&self, id: ChatId) -> RepositoryFuture<Option<ChatDetails>>;

    /// 原子 upsert：以规范化用户对为键。已存在则复用并清除两侧删除标记，
    /// 否则以 `candidate` 插入新会话。
    fn find_or_create(&self, candidate: Chat) -> RepositoryFuture<ChatDetails>;

    /// 只设置一侧的删除标记；会话不存在时返回 `None`。
    fn soft_delete(
        &self,
        id: ChatId,
        side: ChatSide,
        now: Timestamp,
    ) -> RepositoryFuture<Option<Chat>>;
}

pub trait MessageRepository: Send + Sync {
    fn create(&self, message: Message) -> RepositoryFuture<Message>;
    fn find_by_id(&self, id: MessageId) -> RepositoryFuture<Option<Message>>;

    /// 更新内容并置 `is_edited = true`；消息不存在时返回 `RepositoryError::NotFound`。
    fn update_content(
        &self,
        id: MessageId,
        content: MessageContent,
        now: Timestamp,
    ) -> RepositoryFuture<Message>;

    /// 按操作者是否为发送者设置对应一侧的删除标记。
    fn soft_delete(
        &self,
        id: MessageId,
        acting_user: UserId,
        now: Timestamp,
    ) -> RepositoryFuture<Message>;
}
