use serde::{Deserialize, Serialize};

use crate::value_objects::{ChatId, MessageContent, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub is_edited: bool,
    pub deleted_for_sender: bool,
    pub deleted_for_receiver: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Message {
    pub fn new(
        id: MessageId,
        chat_id: ChatId,
        sender_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            chat_id,
            sender_id,
            content,
            is_edited: false,
            deleted_for_sender: false,
            deleted_for_receiver: false,
            created_at,
            updated_at: created_at,
        }
    }

    /// 编辑后 `is_edited` 永久为 true。
    pub fn edit(&mut self, content: MessageContent, now: Timestamp) {
        self.content = content;
        self.is_edited = true;
        self.updated_at = now;
    }

    /// 按操作者身份隐藏消息：发送者删除只对发送者隐藏，反之亦然。
    /// 已设置的另一侧标记保持不变。
    pub fn delete_for(&mut self, actor: UserId, now: Timestamp) {
        if actor == self.sender_id {
            self.deleted_for_sender = true;
        } else {
            self.deleted_for_receiver = true;
        }
        self.updated_at = now;
    }

    pub fn is_visible_to(&self, user_id: UserId) -> bool {
        if user_id == self.sender_id {
            !self.deleted_for_sender
        } else {
            !self.deleted_for_receiver
        }
    }
}
