use std::collections::HashMap;
use std::sync::Arc;

use domain::{
    Chat, ChatDetails, ChatId, ChatRepository, ChatSide, DisplayName, Message, MessageContent,
    MessageId, MessageRepository, PasswordHash, RepositoryError, RepositoryFuture,
    RepositoryResult, Timestamp, User, UserEmail, UserId, UserProfile, UserRepository,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

const CHAT_COLUMNS: &str =
    "id, initiator_id, other_id, deleted_for_initiator, deleted_for_other, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, is_edited, deleted_for_sender, \
     deleted_for_receiver, created_at, updated_at";

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RepositoryError::Conflict;
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    email: String,
    name: String,
    password_hash: String,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl TryFrom<UserRecord> for User {
    type Error = RepositoryError;

    fn try_from(value: UserRecord) -> Result<Self, Self::Error> {
        let email = UserEmail::parse(value.email).map_err(|err| invalid_data(err.to_string()))?;
        let name = DisplayName::parse(value.name).map_err(|err| invalid_data(err.to_string()))?;
        let password =
            PasswordHash::new(value.password_hash).map_err(|err| invalid_data(err.to_string()))?;

        Ok(User {
            id: UserId::from(value.id),
            email,
            name,
            password,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

/// 只含公开字段，查询时从不读取密码列
#[derive(Debug, FromRow)]
struct ProfileRecord {
    id: Uuid,
    name: String,
    email: String,
}

impl TryFrom<ProfileRecord> for UserProfile {
    type Error = RepositoryError;

    fn try_from(value: ProfileRecord) -> Result<Self, Self::Error> {
        Ok(UserProfile {
            id: UserId::from(value.id),
            name: DisplayName::parse(value.name).map_err(|err| invalid_data(err.to_string()))?,
            email: UserEmail::parse(value.email).map_err(|err| invalid_data(err.to_string()))?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ChatRecord {
    id: Uuid,
    initiator_id: Uuid,
    other_id: Uuid,
    deleted_for_initiator: bool,
    deleted_for_other: bool,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl From<ChatRecord> for Chat {
    fn from(value: ChatRecord) -> Self {
        Chat {
            id: ChatId::from(value.id),
            initiator_id: UserId::from(value.initiator_id),
            other_id: UserId::from(value.other_id),
            deleted_for_initiator: value.deleted_for_initiator,
            deleted_for_other: value.deleted_for_other,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    content: String,
    is_edited: bool,
    deleted_for_sender: bool,
    deleted_for_receiver: bool,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message {
            id: MessageId::from(value.id),
            chat_id: ChatId::from(value.chat_id),
            sender_id: UserId::from(value.sender_id),
            content,
            is_edited: value.is_edited,
            deleted_for_sender: value.deleted_for_sender,
            deleted_for_receiver: value.deleted_for_receiver,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

/// 为一批会话行补齐双方资料与有序消息，两次批量查询完成。
async fn assemble_details(
    pool: &PgPool,
    records: Vec<ChatRecord>,
) -> RepositoryResult<Vec<ChatDetails>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let chat_ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
    let user_ids: Vec<Uuid> = records
        .iter()
        .flat_map(|record| [record.initiator_id, record.other_id])
        .collect();

    let profiles = sqlx::query_as::<_, ProfileRecord>(
        r#"SELECT id, name, email FROM users WHERE id = ANY($1)"#,
    )
    .bind(&user_ids)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_err)?
    .into_iter()
    .map(|record| UserProfile::try_from(record).map(|profile| (profile.id, profile)))
    .collect::<RepositoryResult<HashMap<UserId, UserProfile>>>()?;

    let mut messages: HashMap<ChatId, Vec<Message>> = HashMap::new();
    let rows = sqlx::query_as::<_, MessageRecord>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ANY($1) ORDER BY created_at ASC, id ASC"
    ))
    .bind(&chat_ids)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_err)?;
    for row in rows {
        let message = Message::try_from(row)?;
        messages.entry(message.chat_id).or_default().push(message);
    }

    records
        .into_iter()
        .map(|record| -> RepositoryResult<ChatDetails> {
            let chat = Chat::from(record);
            let profile = |id: UserId| {
                profiles
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| invalid_data(format!("participant {id} is missing")))
            };
            Ok(ChatDetails {
                initiator: profile(chat.initiator_id)?,
                other: profile(chat.other_id)?,
                messages: messages.remove(&chat.id).unwrap_or_default(),
                chat,
            })
        })
        .collect()
}

async fn single_details(pool: &PgPool, record: ChatRecord) -> RepositoryResult<ChatDetails> {
    assemble_details(pool, vec![record])
        .await?
        .pop()
        .ok_or(RepositoryError::NotFound)
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl UserRepository for PgUserRepository {
    fn create(&self, user: User) -> RepositoryFuture<User> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, UserRecord>(
                r#"
                INSERT INTO users (id, email, name, password_hash, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, email, name, password_hash, created_at, updated_at
                "#,
            )
            .bind(Uuid::from(user.id))
            .bind(user.email.as_str())
            .bind(user.name.as_str())
            .bind(user.password.as_str())
            .bind(user.created_at)
            .bind(user.updated_at)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            User::try_from(record)
        })
    }

    fn find_by_id(&self, id: UserId) -> RepositoryFuture<Option<User>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, UserRecord>(
                r#"SELECT id, email, name, password_hash, created_at, updated_at FROM users WHERE id = $1"#,
            )
            .bind(Uuid::from(id))
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            record.map(User::try_from).transpose()
        })
    }

    fn find_by_email(&self, email: UserEmail) -> RepositoryFuture<Option<User>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, UserRecord>(
                r#"SELECT id, email, name, password_hash, created_at, updated_at FROM users WHERE email = $1"#,
            )
            .bind(email.as_str())
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            record.map(User::try_from).transpose()
        })
    }

    fn list_profiles(&self) -> RepositoryFuture<Vec<UserProfile>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let records = sqlx::query_as::<_, ProfileRecord>(
                r#"SELECT id, name, email FROM users ORDER BY created_at ASC"#,
            )
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            records
                .into_iter()
                .map(UserProfile::try_from)
                .collect::<RepositoryResult<Vec<_>>>()
        })
    }
}

#[derive(Clone)]
pub struct PgChatRepository {
    pool: PgPool,
}

impl PgChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ChatRepository for PgChatRepository {
    fn find_all_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<ChatDetails>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let records = sqlx::query_as::<_, ChatRecord>(&format!(
                r#"
                SELECT {CHAT_COLUMNS} FROM chats
                WHERE (initiator_id = $1 AND NOT deleted_for_initiator)
                   OR (other_id = $1 AND NOT deleted_for_other)
                ORDER BY updated_at DESC
                "#
            ))
            .bind(Uuid::from(user_id))
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            assemble_details(&pool, records).await
        })
    }

    fn find_by_id(&self, id: ChatId) -> RepositoryFuture<Option<ChatDetails>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, ChatRecord>(&format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1"
            ))
            .bind(Uuid::from(id))
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            match record {
                Some(record) => single_details(&pool, record).await.map(Some),
                None => Ok(None),
            }
        })
    }

    fn find_or_create(&self, candidate: Chat) -> RepositoryFuture<ChatDetails> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let pair = candidate.pair();
            // 冲突时沿用已有行（保留原发起方），同时复活两侧
            let record = sqlx::query_as::<_, ChatRecord>(&format!(
                r#"
                INSERT INTO chats (id, initiator_id, other_id, user_low, user_high,
                                   deleted_for_initiator, deleted_for_other, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, FALSE, FALSE, $6, $7)
                ON CONFLICT (user_low, user_high) DO UPDATE
                SET deleted_for_initiator = FALSE,
                    deleted_for_other = FALSE,
                    updated_at = EXCLUDED.updated_at
                RETURNING {CHAT_COLUMNS}
                "#
            ))
            .bind(Uuid::from(candidate.id))
            .bind(Uuid::from(candidate.initiator_id))
            .bind(Uuid::from(candidate.other_id))
            .bind(Uuid::from(pair.low()))
            .bind(Uuid::from(pair.high()))
            .bind(candidate.created_at)
            .bind(candidate.updated_at)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            single_details(&pool, record).await
        })
    }

    fn soft_delete(
        &self,
        id: ChatId,
        side: ChatSide,
        now: Timestamp,
    ) -> RepositoryFuture<Option<Chat>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, ChatRecord>(&format!(
                r#"
                UPDATE chats
                SET deleted_for_initiator = deleted_for_initiator OR $2,
                    deleted_for_other = deleted_for_other OR $3,
                    updated_at = $4
                WHERE id = $1
                RETURNING {CHAT_COLUMNS}
                "#
            ))
            .bind(Uuid::from(id))
            .bind(side == ChatSide::Initiator)
            .bind(side == ChatSide::Other)
            .bind(now)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(record.map(Chat::from))
        })
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MessageRepository for PgMessageRepository {
    fn create(&self, message: Message) -> RepositoryFuture<Message> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                INSERT INTO messages (id, chat_id, sender_id, content, is_edited,
                                      deleted_for_sender, deleted_for_receiver, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(Uuid::from(message.id))
            .bind(Uuid::from(message.chat_id))
            .bind(Uuid::from(message.sender_id))
            .bind(message.content.as_str())
            .bind(message.is_edited)
            .bind(message.deleted_for_sender)
            .bind(message.deleted_for_receiver)
            .bind(message.created_at)
            .bind(message.updated_at)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Message::try_from(record)
        })
    }

    fn find_by_id(&self, id: MessageId) -> RepositoryFuture<Option<Message>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, MessageRecord>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
            ))
            .bind(Uuid::from(id))
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            record.map(Message::try_from).transpose()
        })
    }

    fn update_content(
        &self,
        id: MessageId,
        content: MessageContent,
        now: Timestamp,
    ) -> RepositoryFuture<Message> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                UPDATE messages
                SET content = $2, is_edited = TRUE, updated_at = $3
                WHERE id = $1
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(Uuid::from(id))
            .bind(content.as_str())
            .bind(now)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            Message::try_from(record)
        })
    }

    fn soft_delete(
        &self,
        id: MessageId,
        acting_user: UserId,
        now: Timestamp,
    ) -> RepositoryFuture<Message> {
        let pool = self.pool.clone();
        Box::pin(async move {
            // 只置位操作者一侧，另一侧已有的标记保持不变
            let record = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                UPDATE messages
                SET deleted_for_sender = deleted_for_sender OR sender_id = $2,
                    deleted_for_receiver = deleted_for_receiver OR sender_id <> $2,
                    updated_at = $3
                WHERE id = $1
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(Uuid::from(id))
            .bind(Uuid::from(acting_user))
            .bind(now)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            Message::try_from(record)
        })
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub chat_repository: Arc<PgChatRepository>,
    pub message_repository: Arc<PgMessageRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            chat_repository: Arc::new(PgChatRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
