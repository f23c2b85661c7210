use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::message::Message;
use crate::user::UserProfile;
use crate::value_objects::{ChatId, Timestamp, UserId};

/// 会话中的一方。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSide {
    Initiator,
    Other,
}

/// 无序用户对的规范化键：`low < high`。
///
/// 存储层以此键做唯一约束，保证同一对用户最多只有一个会话。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatPair {
    low: UserId,
    high: UserId,
}

impl ChatPair {
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::CannotChatWithSelf);
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }
}

/// 两个用户之间的会话，`initiator_id` 是首次发起方。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub initiator_id: UserId,
    pub other_id: UserId,
    pub deleted_for_initiator: bool,
    pub deleted_for_other: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Chat {
    pub fn start(
        id: ChatId,
        initiator_id: UserId,
        other_id: UserId,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        ChatPair::new(initiator_id, other_id)?;
        Ok(Self {
            id,
            initiator_id,
            other_id,
            deleted_for_initiator: false,
            deleted_for_other: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn pair(&self) -> ChatPair {
        let (low, high) = if self.initiator_id < self.other_id {
            (self.initiator_id, self.other_id)
        } else {
            (self.other_id, self.initiator_id)
        };
        ChatPair { low, high }
    }

    pub fn side_of(&self, user_id: UserId) -> Option<ChatSide> {
        if user_id == self.initiator_id {
            Some(ChatSide::Initiator)
        } else if user_id == self.other_id {
            Some(ChatSide::Other)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.side_of(user_id).is_some()
    }

    /// 给定一方，返回另一方；非参与方返回 `None`。
    pub fn counterpart_of(&self, user_id: UserId) -> Option<UserId> {
        match self.side_of(user_id)? {
            ChatSide::Initiator => Some(self.other_id),
            ChatSide::Other => Some(self.initiator_id),
        }
    }

    pub fn is_deleted_for(&self, side: ChatSide) -> bool {
        match side {
            ChatSide::Initiator => self.deleted_for_initiator,
            ChatSide::Other => self.deleted_for_other,
        }
    }

    /// 单侧软删除，另一方不受影响。
    pub fn delete_for(&mut self, side: ChatSide, now: Timestamp) {
        match side {
            ChatSide::Initiator => self.deleted_for_initiator = true,
            ChatSide::Other => self.deleted_for_other = true,
        }
        self.updated_at = now;
    }

    /// 任意一方重新发起联系时，清除两侧删除标记。
    pub fn reactivate(&mut self, now: Timestamp) {
        self.deleted_for_initiator = false;
        self.deleted_for_other = false;
        self.updated_at = now;
    }

    /// 会话是否出现在该用户的会话列表里。
    pub fn is_listed_for(&self, user_id: UserId) -> bool {
        self.side_of(user_id)
            .map(|side| !self.is_deleted_for(side))
            .unwrap_or(false)
    }
}

/// 会话的规范快照：会话本身、双方公开资料以及按创建时间排序的消息。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDetails {
    #[serde(flatten)]
    pub chat: Chat,
    pub initiator: UserProfile,
    pub other: UserProfile,
    pub messages: Vec<Message>,
}

impl ChatDetails {
    pub fn id(&self) -> ChatId {
        self.chat.id
    }
}
