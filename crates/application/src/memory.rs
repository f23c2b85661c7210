//! 进程内存储
//!
//! 在一把锁内实现全部仓储契约，`find_or_create` 的查找、插入与复活是同一个
//! 临界区。用于测试以及 `database.in_memory = true` 的本地运行。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::{
    Chat, ChatDetails, ChatId, ChatPair, ChatRepository, ChatSide, Message, MessageContent,
    MessageId, MessageRepository, RepositoryError, RepositoryFuture, Timestamp, User, UserEmail,
    UserId, UserProfile, UserRepository,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    chats: HashMap<ChatId, Chat>,
    pairs: HashMap<ChatPair, ChatId>,
    /// 按插入顺序保存
    messages: Vec<Message>,
}

impl MemoryState {
    fn profile(&self, id: UserId) -> Result<UserProfile, RepositoryError> {
        self.users
            .get(&id)
            .map(User::profile)
            .ok_or_else(|| RepositoryError::storage(format!("participant {id} is missing")))
    }

    fn details(&self, chat: &Chat) -> Result<ChatDetails, RepositoryError> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|message| message.chat_id == chat.id)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.created_at);
        Ok(ChatDetails {
            chat: chat.clone(),
            initiator: self.profile(chat.initiator_id)?,
            other: self.profile(chat.other_id)?,
            messages,
        })
    }

    fn message_mut(&mut self, id: MessageId) -> Result<&mut Message, RepositoryError> {
        self.messages
            .iter_mut()
            .find(|message| message.id == id)
            .ok_or(RepositoryError::NotFound)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 该用户对出现的会话行数，用于校验“每对用户至多一个会话”。
    pub fn chat_count_for_pair(&self, a: UserId, b: UserId) -> usize {
        let state = self.lock();
        state
            .chats
            .values()
            .filter(|chat| chat.is_participant(a) && chat.is_participant(b))
            .count()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }
}

impl UserRepository for MemoryStorage {
    fn create(&self, user: User) -> RepositoryFuture<User> {
        let storage = self.clone();
        Box::pin(async move {
            let mut state = storage.lock();
            if state.users.values().any(|existing| existing.email == user.email) {
                return Err(RepositoryError::Conflict);
            }
            state.users.insert(user.id, user.clone());
            Ok(user)
        })
    }

    fn find_by_id(&self, id: UserId) -> RepositoryFuture<Option<User>> {
        let storage = self.clone();
        Box::pin(async move { Ok(storage.lock().users.get(&id).cloned()) })
    }

    fn find_by_email(&self, email: UserEmail) -> RepositoryFuture<Option<User>> {
        let storage = self.clone();
        Box::pin(async move {
            Ok(storage
                .lock()
                .users
                .values()
                .find(|user| user.email == email)
                .cloned())
        })
    }

    fn list_profiles(&self) -> RepositoryFuture<Vec<UserProfile>> {
        let storage = self.clone();
        Box::pin(async move {
            let state = storage.lock();
            let mut users: Vec<&User> = state.users.values().collect();
            users.sort_by_key(|user| user.created_at);
            Ok(users.into_iter().map(User::profile).collect())
        })
    }
}

impl ChatRepository for MemoryStorage {
    fn find_all_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<ChatDetails>> {
        let storage = self.clone();
        Box::pin(async move {
            let state = storage.lock();
            let mut chats: Vec<&Chat> = state
                .chats
                .values()
                .filter(|chat| chat.is_listed_for(user_id))
                .collect();
            chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            chats
                .into_iter()
                .map(|chat| state.details(chat))
                .collect::<Result<Vec<_>, _>>()
        })
    }

    fn find_by_id(&self, id: ChatId) -> RepositoryFuture<Option<ChatDetails>> {
        let storage = self.clone();
        Box::pin(async move {
            let state = storage.lock();
            state.chats.get(&id).map(|chat| state.details(chat)).transpose()
        })
    }

    fn find_or_create(&self, candidate: Chat) -> RepositoryFuture<ChatDetails> {
        let storage = self.clone();
        Box::pin(async move {
            let mut state = storage.lock();
            let pair = candidate.pair();
            let id = match state.pairs.get(&pair).copied() {
                Some(existing) => {
                    let chat = state
                        .chats
                        .get_mut(&existing)
                        .ok_or_else(|| RepositoryError::storage("dangling chat pair index"))?;
                    chat.reactivate(candidate.updated_at);
                    existing
                }
                None => {
                    let id = candidate.id;
                    state.pairs.insert(pair, id);
                    state.chats.insert(id, candidate);
                    id
                }
            };
            let chat = state.chats.get(&id).ok_or(RepositoryError::NotFound)?;
            state.details(chat)
        })
    }

    fn soft_delete(
        &self,
        id: ChatId,
        side: ChatSide,
        now: Timestamp,
    ) -> RepositoryFuture<Option<Chat>> {
        let storage = self.clone();
        Box::pin(async move {
            let mut state = storage.lock();
            Ok(state.chats.get_mut(&id).map(|chat| {
                chat.delete_for(side, now);
                chat.clone()
            }))
        })
    }
}

impl MessageRepository for MemoryStorage {
    fn create(&self, message: Message) -> RepositoryFuture<Message> {
        let storage = self.clone();
        Box::pin(async move {
            let mut state = storage.lock();
            if !state.chats.contains_key(&message.chat_id) {
                return Err(RepositoryError::storage(format!(
                    "chat {} does not exist",
                    message.chat_id
                )));
            }
            state.messages.push(message.clone());
            Ok(message)
        })
    }

    fn find_by_id(&self, id: MessageId) -> RepositoryFuture<Option<Message>> {
        let storage = self.clone();
        Box::pin(async move {
            Ok(storage
                .lock()
                .messages
                .iter()
                .find(|message| message.id == id)
                .cloned())
        })
    }

    fn update_content(
        &self,
        id: MessageId,
        content: MessageContent,
        now: Timestamp,
    ) -> RepositoryFuture<Message> {
        let storage = self.clone();
        Box::pin(async move {
            let mut state = storage.lock();
            state.message_mut(id).map(|message| {
                message.edit(content, now);
                message.clone()
            })
        })
    }

    fn soft_delete(
        &self,
        id: MessageId,
        acting_user: UserId,
        now: Timestamp,
    ) -> RepositoryFuture<Message> {
        let storage = self.clone();
        Box::pin(async move {
            let mut state = storage.lock();
            state.message_mut(id).map(|message| {
                message.delete_for(acting_user, now);
                message.clone()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use domain::{DisplayName, PasswordHash};
    use uuid::Uuid;

    async fn seed_user(storage: &MemoryStorage, email: &str) -> UserId {
        let user = User::register(
            UserId::from(Uuid::new_v4()),
            UserEmail::parse(email).unwrap(),
            Some(DisplayName::parse(email.split('@').next().unwrap()).unwrap()),
            PasswordHash::new("hash").unwrap(),
            Utc::now(),
        );
        UserRepository::create(storage, user).await.unwrap().id
    }

    fn candidate(initiator: UserId, other: UserId) -> Chat {
        Chat::start(ChatId::from(Uuid::new_v4()), initiator, other, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let storage = MemoryStorage::new();
        seed_user(&storage, "a@example.com").await;
        let dup = User::register(
            UserId::from(Uuid::new_v4()),
            UserEmail::parse("a@example.com").unwrap(),
            None,
            PasswordHash::new("hash").unwrap(),
            Utc::now(),
        );
        assert_eq!(
            UserRepository::create(&storage, dup).await,
            Err(RepositoryError::Conflict)
        );
    }

    #[tokio::test]
    async fn find_or_create_reuses_pair_in_either_order_and_reactivates() {
        let storage = MemoryStorage::new();
        let a = seed_user(&storage, "a@example.com").await;
        let b = seed_user(&storage, "b@example.com").await;

        let first = storage.find_or_create(candidate(a, b)).await.unwrap();
        ChatRepository::soft_delete(&storage, first.id(), ChatSide::Initiator, Utc::now())
            .await
            .unwrap();
        ChatRepository::soft_delete(&storage, first.id(), ChatSide::Other, Utc::now())
            .await
            .unwrap();

        let second = storage.find_or_create(candidate(b, a)).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(second.chat.initiator_id, a);
        assert!(!second.chat.deleted_for_initiator);
        assert!(!second.chat.deleted_for_other);
        assert_eq!(storage.chat_count_for_pair(a, b), 1);
        assert_eq!(second.initiator.id, a);
        assert_eq!(second.other.id, b);
    }

    #[tokio::test]
    async fn list_excludes_chats_deleted_on_caller_side() {
        let storage = MemoryStorage::new();
        let a = seed_user(&storage, "a@example.com").await;
        let b = seed_user(&storage, "b@example.com").await;
        let c = seed_user(&storage, "c@example.com").await;

        let ab = storage.find_or_create(candidate(a, b)).await.unwrap();
        let mut later = candidate(a, c);
        later.updated_at = Utc::now() + Duration::seconds(5);
        let ac = storage.find_or_create(later).await.unwrap();

        let listed: Vec<ChatId> = storage
            .find_all_for_user(a)
            .await
            .unwrap()
            .iter()
            .map(ChatDetails::id)
            .collect();
        assert_eq!(listed, vec![ac.id(), ab.id()]);

        ChatRepository::soft_delete(&storage, ab.id(), ChatSide::Initiator, Utc::now())
            .await
            .unwrap();
        assert_eq!(storage.find_all_for_user(a).await.unwrap().len(), 1);
        assert_eq!(storage.find_all_for_user(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_mutations_report_missing_rows() {
        let storage = MemoryStorage::new();
        let missing = MessageId::from(Uuid::new_v4());
        assert_eq!(
            storage
                .update_content(missing, MessageContent::new("x").unwrap(), Utc::now())
                .await,
            Err(RepositoryError::NotFound)
        );
        assert_eq!(
            MessageRepository::soft_delete(
                &storage,
                missing,
                UserId::from(Uuid::new_v4()),
                Utc::now()
            )
            .await,
            Err(RepositoryError::NotFound)
        );
    }

    #[tokio::test]
    async fn chat_snapshot_orders_messages_by_creation() {
        let storage = MemoryStorage::new();
        let a = seed_user(&storage, "a@example.com").await;
        let b = seed_user(&storage, "b@example.com").await;
        let chat = storage.find_or_create(candidate(a, b)).await.unwrap();
        let base = Utc::now();

        for (offset, text) in [(2, "third"), (0, "first"), (1, "second")] {
            let message = Message::new(
                MessageId::from(Uuid::new_v4()),
                chat.id(),
                a,
                MessageContent::new(text).unwrap(),
                base + Duration::seconds(offset),
            );
            MessageRepository::create(&storage, message).await.unwrap();
        }

        let snapshot = ChatRepository::find_by_id(&storage, chat.id())
            .await
            .unwrap()
            .unwrap();
        let texts: Vec<&str> = snapshot
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }
}
