use std::sync::Arc;

use domain::{
    Chat, ChatDetails, ChatId, ChatRepository, DomainError, Message, MessageContent, MessageId,
    MessageRepository, UserId, UserRepository,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    auth::Principal,
    broadcaster::EventBroadcaster,
    clock::Clock,
    error::ApplicationError,
    events::{
        ChatDeletedPayload, ChatUpdatedPayload, ClientEvent, DeleteChatPayload,
        DeleteMessagePayload, EditMessagePayload, MessageDeletedPayload, ReceiveMessagePayload,
        SendMessagePayload, ServerEvent,
    },
    presence::ConnectionId,
};

/// 事件来源：认证身份加上发起事件的那条连接。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOrigin {
    pub principal: Principal,
    pub connection_id: ConnectionId,
}

impl EventOrigin {
    pub fn new(principal: Principal, connection_id: ConnectionId) -> Self {
        Self {
            principal,
            connection_id,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }
}

pub struct ConversationEngineDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub chat_repository: Arc<dyn ChatRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
    pub clock: Arc<dyn Clock>,
}

/// 会话引擎：对每个入站事件做授权、调用存储、计算投递目标。
///
/// 不跨事件缓存任何会话或消息；每次变更后都重新读取规范快照再广播。
pub struct ConversationEngine {
    deps: ConversationEngineDependencies,
}

impl ConversationEngine {
    pub fn new(deps: ConversationEngineDependencies) -> Self {
        Self { deps }
    }

    /// 处理入口。失败只记录日志并向发起连接回送通用错误事件，不影响连接本身。
    pub async fn handle_event(&self, origin: EventOrigin, event: ClientEvent) {
        let name = event.name();
        let result = match event {
            ClientEvent::SendMessage(payload) => self.send_message(origin, payload).await.map(drop),
            ClientEvent::EditMessage(payload) => self.edit_message(origin, payload).await.map(drop),
            ClientEvent::DeleteMessage(payload) => {
                self.delete_message(origin, payload).await.map(drop)
            }
            ClientEvent::DeleteChat(payload) => self.delete_chat(origin, payload).await,
        };

        if let Err(err) = result {
            match &err {
                ApplicationError::Repository(_)
                | ApplicationError::Password(_)
                | ApplicationError::Token(_) => {
                    error!(event = name, user_id = %origin.user_id(), error = %err, "event handler failed");
                }
                _ => {
                    warn!(event = name, user_id = %origin.user_id(), error = %err, "event rejected");
                }
            }
            self.emit_to_connection(origin, ServerEvent::error(failure_message(name, &err)));
        }
    }

    pub async fn send_message(
        &self,
        origin: EventOrigin,
        payload: SendMessagePayload,
    ) -> Result<ReceiveMessagePayload, ApplicationError> {
        let sender_id = origin.user_id();
        let receiver_id = payload.receiver_id;
        let content = MessageContent::new(payload.content)?;
        let now = self.deps.clock.now();
        let candidate = Chat::start(ChatId::from(Uuid::new_v4()), sender_id, receiver_id, now)?;
        self.require_user(receiver_id).await?;

        let chat = self.deps.chat_repository.find_or_create(candidate).await?;
        let message = Message::new(
            MessageId::from(Uuid::new_v4()),
            chat.id(),
            sender_id,
            content,
            now,
        );
        let message = self.deps.message_repository.create(message).await?;
        let chat = self.load_chat(chat.id()).await?;

        debug!(chat_id = %chat.id(), message_id = %message.id, sender_id = %sender_id, "message stored");

        let payload = ReceiveMessagePayload { message, chat };
        self.emit_to_connection(origin, ServerEvent::ReceiveMessage(payload.clone()));
        self.deps
            .broadcaster
            .to_user(receiver_id, ServerEvent::ReceiveMessage(payload.clone()));
        Ok(payload)
    }

    pub async fn edit_message(
        &self,
        origin: EventOrigin,
        payload: EditMessagePayload,
    ) -> Result<Message, ApplicationError> {
        let content = MessageContent::new(payload.content)?;
        let message = self
            .find_message_in_chat(payload.message_id, payload.chat_id)
            .await?;
        if message.sender_id != origin.user_id() {
            return Err(ApplicationError::Forbidden);
        }

        let updated = self
            .deps
            .message_repository
            .update_content(message.id, content, self.deps.clock.now())
            .await?;
        let chat = self.load_chat(updated.chat_id).await?;

        self.emit_to_connection(origin, ServerEvent::MessageUpdated(updated.clone()));
        if let Some(other) = chat.chat.counterpart_of(origin.user_id()) {
            self.deps
                .broadcaster
                .to_user(other, ServerEvent::MessageUpdated(updated.clone()));
        }
        self.push_snapshot(origin, chat);
        Ok(updated)
    }

    pub async fn delete_message(
        &self,
        origin: EventOrigin,
        payload: DeleteMessagePayload,
    ) -> Result<Message, ApplicationError> {
        let actor = origin.user_id();
        let message = self
            .find_message_in_chat(payload.message_id, payload.chat_id)
            .await?;
        let chat = self.load_chat(message.chat_id).await?;
        if !chat.chat.is_participant(actor) {
            return Err(ApplicationError::Forbidden);
        }

        let updated = self
            .deps
            .message_repository
            .soft_delete(message.id, actor, self.deps.clock.now())
            .await?;
        let is_sender = updated.sender_id == actor;

        self.emit_to_connection(
            origin,
            ServerEvent::MessageDeleted(MessageDeletedPayload {
                message_id: updated.id,
                is_sender,
            }),
        );
        if let Some(other) = chat.chat.counterpart_of(actor) {
            self.deps.broadcaster.to_user(
                other,
                ServerEvent::MessageDeleted(MessageDeletedPayload {
                    message_id: updated.id,
                    is_sender: !is_sender,
                }),
            );
        }

        let chat = self.load_chat(chat.id()).await?;
        self.push_snapshot(origin, chat);
        Ok(updated)
    }

    /// 单侧软删除，只通知发起连接。
    pub async fn delete_chat(
        &self,
        origin: EventOrigin,
        payload: DeleteChatPayload,
    ) -> Result<(), ApplicationError> {
        let chat = self.load_chat(payload.chat_id).await?;
        let side = chat
            .chat
            .side_of(origin.user_id())
            .ok_or(ApplicationError::Forbidden)?;

        self.deps
            .chat_repository
            .soft_delete(chat.id(), side, self.deps.clock.now())
            .await?
            .ok_or(DomainError::ChatNotFound)?;

        debug!(chat_id = %chat.id(), user_id = %origin.user_id(), "chat hidden for one side");
        self.emit_to_connection(
            origin,
            ServerEvent::ChatDeleted(ChatDeletedPayload {
                chat_id: chat.id(),
            }),
        );
        Ok(())
    }

    /// 会话列表快照：不含调用方一侧已删除的会话，按更新时间倒序。
    pub async fn list_chats(&self, principal: Principal) -> Result<Vec<ChatDetails>, ApplicationError> {
        let chats = self
            .deps
            .chat_repository
            .find_all_for_user(principal.user_id)
            .await?;
        Ok(chats)
    }

    pub async fn get_chat(
        &self,
        principal: Principal,
        chat_id: ChatId,
    ) -> Result<ChatDetails, ApplicationError> {
        let chat = self.load_chat(chat_id).await?;
        if !chat.chat.is_participant(principal.user_id) {
            return Err(ApplicationError::Forbidden);
        }
        Ok(chat)
    }

    /// 显式发起会话；已存在时复用并清除两侧删除标记。
    pub async fn start_chat(
        &self,
        principal: Principal,
        receiver_id: UserId,
    ) -> Result<ChatDetails, ApplicationError> {
        let candidate = Chat::start(
            ChatId::from(Uuid::new_v4()),
            principal.user_id,
            receiver_id,
            self.deps.clock.now(),
        )?;
        self.require_user(receiver_id).await?;
        let chat = self.deps.chat_repository.find_or_create(candidate).await?;
        Ok(chat)
    }

    async fn require_user(&self, user_id: UserId) -> Result<(), ApplicationError> {
        self.deps
            .user_repository
            .find_by_id(user_id)
            .await?
            .ok_or(DomainError::UserNotFound)?;
        Ok(())
    }

    async fn load_chat(&self, chat_id: ChatId) -> Result<ChatDetails, ApplicationError> {
        let chat = self
            .deps
            .chat_repository
            .find_by_id(chat_id)
            .await?
            .ok_or(DomainError::ChatNotFound)?;
        Ok(chat)
    }

    /// 消息必须存在且属于给定会话。
    async fn find_message_in_chat(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
    ) -> Result<Message, ApplicationError> {
        let message = self
            .deps
            .message_repository
            .find_by_id(message_id)
            .await?
            .filter(|message| message.chat_id == chat_id)
            .ok_or(DomainError::MessageNotFound)?;
        Ok(message)
    }

    fn push_snapshot(&self, origin: EventOrigin, chat: ChatDetails) {
        if let Some(other) = chat.chat.counterpart_of(origin.user_id()) {
            self.deps.broadcaster.to_user(
                other,
                ServerEvent::ChatUpdated(ChatUpdatedPayload { chat: chat.clone() }),
            );
        }
        self.emit_to_connection(origin, ServerEvent::ChatUpdated(ChatUpdatedPayload { chat }));
    }

    fn emit_to_connection(&self, origin: EventOrigin, event: ServerEvent) {
        if let Err(err) = self.deps.broadcaster.to_connection(origin.connection_id, event) {
            warn!(connection_id = %origin.connection_id, error = %err, "failed to reach origin connection");
        }
    }
}

fn failure_message(event: &str, err: &ApplicationError) -> &'static str {
    match (event, err) {
        (_, ApplicationError::Forbidden) => "Not allowed",
        ("delete_chat", ApplicationError::Domain(DomainError::ChatNotFound)) => "Chat not found",
        ("send_message", _) => "Failed to send message",
        ("edit_message", _) => "Failed to edit message",
        ("delete_message", _) => "Failed to delete message",
        ("delete_chat", _) => "Failed to delete chat",
        _ => "Request failed",
    }
}
