//! 会话引擎集成测试
//!
//! 使用进程内存储与真实的连接中心，验证授权、单侧删除、投递目标以及
//! 并发首次联系下的会话唯一性。

use std::sync::Arc;

use application::events::{
    DeleteChatPayload, DeleteMessagePayload, EditMessagePayload, MessageDeletedPayload,
    SendMessagePayload,
};
use application::{
    ApplicationError, ClientEvent, ConnectionHandle, ConnectionHub, ConversationEngine,
    ConversationEngineDependencies, EventOrigin, MemoryStorage, PresenceRegistry, Principal,
    ServerEvent, SteppingClock,
};
use chrono::Utc;
use domain::{
    Chat, ChatDetails, ChatId, ChatRepository, ChatSide, DisplayName, DomainError, MessageId,
    PasswordHash, RepositoryError, RepositoryFuture, Timestamp, User, UserEmail, UserId,
    UserRepository,
};
use futures::future::join_all;
use mockall::mock;
use uuid::Uuid;

struct Harness {
    storage: MemoryStorage,
    hub: Arc<ConnectionHub>,
    engine: Arc<ConversationEngine>,
}

mock! {
    Chats {}
    impl ChatRepository for Chats {
        fn find_all_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<ChatDetails>>;
        fn find_by_id(&self, id: ChatId) -> RepositoryFuture<Option<ChatDetails>>;
        fn find_or_create(&self, candidate: Chat) -> RepositoryFuture<ChatDetails>;
        fn soft_delete(
            &self,
            id: ChatId,
            side: ChatSide,
            now: Timestamp,
        ) -> RepositoryFuture<Option<Chat>>;
    }
}

impl Harness {
    fn new() -> Self {
        let storage = MemoryStorage::new();
        Self::build(storage.clone(), Arc::new(storage))
    }

    /// 会话存储替换为给定实现，其余仍用内存存储。
    fn with_chat_repository(chat_repository: Arc<dyn ChatRepository>) -> Self {
        Self::build(MemoryStorage::new(), chat_repository)
    }

    fn build(storage: MemoryStorage, chat_repository: Arc<dyn ChatRepository>) -> Self {
        let hub = Arc::new(ConnectionHub::new(Arc::new(PresenceRegistry::new()), 512));
        let engine = Arc::new(ConversationEngine::new(ConversationEngineDependencies {
            user_repository: Arc::new(storage.clone()),
            chat_repository,
            message_repository: Arc::new(storage.clone()),
            broadcaster: hub.clone(),
            clock: Arc::new(SteppingClock::default()),
        }));
        Self {
            storage,
            hub,
            engine,
        }
    }

    async fn user(&self, name: &str) -> UserId {
        let user = User::register(
            UserId::from(Uuid::new_v4()),
            UserEmail::parse(format!("{name}@example.com")).unwrap(),
            Some(DisplayName::parse(name).unwrap()),
            PasswordHash::new("not-a-real-hash").unwrap(),
            Utc::now(),
        );
        UserRepository::create(&self.storage, user).await.unwrap().id
    }

    /// 建立连接并丢弃在线状态事件
    fn connect(&self, user_id: UserId) -> ConnectionHandle {
        let mut handle = self.hub.connect(user_id);
        drain(&mut handle);
        handle
    }
}

fn origin(handle: &ConnectionHandle) -> EventOrigin {
    EventOrigin::new(Principal::new(handle.user_id), handle.id)
}

fn drain(handle: &mut ConnectionHandle) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = handle.receiver.try_recv() {
        if !matches!(event, ServerEvent::UserConnection(_)) {
            events.push(event);
        }
    }
    events
}

fn send(content: &str, receiver_id: UserId) -> SendMessagePayload {
    SendMessagePayload {
        content: content.to_string(),
        receiver_id,
    }
}

#[tokio::test]
async fn first_message_creates_one_chat_and_reaches_both_parties() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let mut a = h.connect(alice);
    let mut b = h.connect(bob);

    let delivered = h.engine.send_message(origin(&a), send("hi", bob)).await.unwrap();

    assert_eq!(h.storage.chat_count_for_pair(alice, bob), 1);
    assert_eq!(h.storage.message_count(), 1);
    assert_eq!(delivered.chat.messages.len(), 1);
    assert_eq!(delivered.chat.chat.initiator_id, alice);
    assert_eq!(delivered.chat.initiator.name.as_str(), "alice");

    let to_alice = drain(&mut a);
    let to_bob = drain(&mut b);
    assert_eq!(to_alice, vec![ServerEvent::ReceiveMessage(delivered.clone())]);
    assert_eq!(to_alice, to_bob);
}

#[tokio::test]
async fn send_reaches_every_tab_of_receiver_but_only_origin_tab_of_sender() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let mut a1 = h.connect(alice);
    let mut a2 = h.connect(alice);
    let mut b1 = h.connect(bob);
    let mut b2 = h.connect(bob);

    h.engine.send_message(origin(&a1), send("hello", bob)).await.unwrap();

    assert_eq!(drain(&mut a1).len(), 1);
    assert!(drain(&mut a2).is_empty());
    assert_eq!(drain(&mut b1).len(), 1);
    assert_eq!(drain(&mut b2).len(), 1);
}

#[tokio::test]
async fn concurrent_first_contact_from_both_sides_creates_single_chat() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let a = h.connect(alice);
    let b = h.connect(bob);

    let sends = (0..20).map(|i| {
        let engine = h.engine.clone();
        let (from, to) = if i % 2 == 0 {
            (origin(&a), bob)
        } else {
            (origin(&b), alice)
        };
        async move { engine.send_message(from, send(&format!("msg {i}"), to)).await }
    });
    let results = join_all(sends).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.storage.chat_count_for_pair(alice, bob), 1);
    assert_eq!(h.storage.message_count(), 20);

    let chat_ids: Vec<ChatId> = results
        .into_iter()
        .map(|result| result.unwrap().chat.id())
        .collect();
    assert!(chat_ids.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn concurrent_start_chat_in_both_orders_converges() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);

    let starts = (0..10).map(|i| {
        let engine = h.engine.clone();
        async move {
            if i % 2 == 0 {
                engine.start_chat(Principal::new(alice), bob).await
            } else {
                engine.start_chat(Principal::new(bob), alice).await
            }
        }
    });
    let results = join_all(starts).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.storage.chat_count_for_pair(alice, bob), 1);
}

#[tokio::test]
async fn sending_to_self_or_unknown_user_fails_without_side_effects() {
    let h = Harness::new();
    let alice = h.user("alice").await;
    let mut a = h.connect(alice);

    let err = h
        .engine
        .send_message(origin(&a), send("echo", alice))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::CannotChatWithSelf)
    ));

    let stranger = UserId::from(Uuid::new_v4());
    let err = h
        .engine
        .send_message(origin(&a), send("hello?", stranger))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = h
        .engine
        .send_message(origin(&a), send("   ", stranger))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::InvalidArgument { .. })
    ));

    assert_eq!(h.storage.message_count(), 0);
    assert!(drain(&mut a).is_empty());
}

#[tokio::test]
async fn only_sender_may_edit_and_edit_flag_sticks() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let mut a = h.connect(alice);
    let mut b = h.connect(bob);
    let sent = h.engine.send_message(origin(&a), send("helo", bob)).await.unwrap();
    drain(&mut a);
    drain(&mut b);

    let edit = |content: &str| EditMessagePayload {
        message_id: sent.message.id,
        chat_id: sent.chat.id(),
        content: content.to_string(),
    };

    let err = h.engine.edit_message(origin(&b), edit("hijack")).await.unwrap_err();
    assert!(matches!(err, ApplicationError::Forbidden));

    let first = h.engine.edit_message(origin(&a), edit("hello")).await.unwrap();
    assert!(first.is_edited);
    assert_eq!(first.content.as_str(), "hello");
    let second = h.engine.edit_message(origin(&a), edit("hello!")).await.unwrap();
    assert!(second.is_edited);

    let to_bob = drain(&mut b);
    assert_eq!(to_bob.len(), 4);
    assert!(matches!(&to_bob[0], ServerEvent::MessageUpdated(m) if m.content.as_str() == "hello"));
    match &to_bob[3] {
        ServerEvent::ChatUpdated(update) => {
            assert_eq!(update.chat.messages[0].content.as_str(), "hello!");
            assert!(update.chat.messages[0].is_edited);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(drain(&mut a).len(), 4);
}

#[tokio::test]
async fn edit_with_foreign_chat_id_is_not_found() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let a = h.connect(alice);
    let sent = h.engine.send_message(origin(&a), send("hi", bob)).await.unwrap();

    let err = h
        .engine
        .edit_message(
            origin(&a),
            EditMessagePayload {
                message_id: sent.message.id,
                chat_id: ChatId::from(Uuid::new_v4()),
                content: "moved".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::MessageNotFound)
    ));
}

#[tokio::test]
async fn message_delete_is_per_side_and_notices_are_relative() {
    let h = Harness::new();
    let (alice, bob, eve) = (h.user("alice").await, h.user("bob").await, h.user("eve").await);
    let mut a = h.connect(alice);
    let mut b = h.connect(bob);
    let e = h.connect(eve);
    let sent = h.engine.send_message(origin(&a), send("secret", bob)).await.unwrap();
    drain(&mut a);
    drain(&mut b);

    let target = DeleteMessagePayload {
        message_id: sent.message.id,
        chat_id: sent.chat.id(),
    };

    let err = h
        .engine
        .delete_message(origin(&e), target.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Forbidden));

    let deleted = h.engine.delete_message(origin(&b), target.clone()).await.unwrap();
    assert!(deleted.deleted_for_receiver);
    assert!(!deleted.deleted_for_sender);

    let to_bob = drain(&mut b);
    assert_eq!(
        to_bob[0],
        ServerEvent::MessageDeleted(MessageDeletedPayload {
            message_id: sent.message.id,
            is_sender: false,
        })
    );
    let to_alice = drain(&mut a);
    assert_eq!(
        to_alice[0],
        ServerEvent::MessageDeleted(MessageDeletedPayload {
            message_id: sent.message.id,
            is_sender: true,
        })
    );
    assert!(matches!(to_alice[1], ServerEvent::ChatUpdated(_)));

    let deleted = h.engine.delete_message(origin(&a), target).await.unwrap();
    assert!(deleted.deleted_for_sender);
    assert!(deleted.deleted_for_receiver);
}

#[tokio::test]
async fn chat_delete_hides_only_the_acting_side() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let mut a = h.connect(alice);
    let mut b = h.connect(bob);
    let sent = h.engine.send_message(origin(&a), send("one", bob)).await.unwrap();
    h.engine.send_message(origin(&b), send("two", alice)).await.unwrap();
    drain(&mut a);
    drain(&mut b);

    h.engine
        .delete_chat(
            origin(&a),
            DeleteChatPayload {
                chat_id: sent.chat.id(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        drain(&mut a),
        vec![ServerEvent::ChatDeleted(
            application::events::ChatDeletedPayload {
                chat_id: sent.chat.id()
            }
        )]
    );
    assert!(drain(&mut b).is_empty());

    assert!(h.engine.list_chats(Principal::new(alice)).await.unwrap().is_empty());
    let bob_view = h.engine.list_chats(Principal::new(bob)).await.unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].messages.len(), 2);
    assert!(!bob_view[0].chat.deleted_for_other);

    let snapshot = h.engine.get_chat(Principal::new(bob), sent.chat.id()).await.unwrap();
    assert!(snapshot.chat.deleted_for_initiator);
    assert!(!snapshot.chat.deleted_for_other);

    // 再次联系时两侧都恢复
    h.engine.send_message(origin(&b), send("back?", alice)).await.unwrap();
    assert_eq!(h.engine.list_chats(Principal::new(alice)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn offline_receiver_reconciles_from_snapshot() {
    let h = Harness::new();
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let a = h.connect(alice);

    h.engine.send_message(origin(&a), send("while you were out", bob)).await.unwrap();

    let mut b = h.connect(bob);
    assert!(drain(&mut b).is_empty());
    let chats = h.engine.list_chats(Principal::new(bob)).await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].messages[0].content.as_str(), "while you were out");
}

#[tokio::test]
async fn get_chat_checks_existence_then_participation() {
    let h = Harness::new();
    let (alice, bob, eve) = (h.user("alice").await, h.user("bob").await, h.user("eve").await);
    let chat = h.engine.start_chat(Principal::new(alice), bob).await.unwrap();

    assert!(h
        .engine
        .get_chat(Principal::new(eve), ChatId::from(Uuid::new_v4()))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(matches!(
        h.engine.get_chat(Principal::new(eve), chat.id()).await,
        Err(ApplicationError::Forbidden)
    ));
    assert_eq!(
        h.engine.get_chat(Principal::new(bob), chat.id()).await.unwrap().id(),
        chat.id()
    );
}

#[tokio::test]
async fn handler_boundary_reports_generic_errors_to_origin_only() {
    let h = Harness::new();
    let (alice, bob, eve) = (h.user("alice").await, h.user("bob").await, h.user("eve").await);
    let mut a = h.connect(alice);
    let mut b = h.connect(bob);
    let mut e = h.connect(eve);
    let sent = h.engine.send_message(origin(&a), send("hi", bob)).await.unwrap();
    drain(&mut a);
    drain(&mut b);

    h.engine
        .handle_event(
            origin(&a),
            ClientEvent::DeleteChat(DeleteChatPayload {
                chat_id: ChatId::from(Uuid::new_v4()),
            }),
        )
        .await;
    assert_eq!(drain(&mut a), vec![ServerEvent::error("Chat not found")]);

    h.engine
        .handle_event(
            origin(&e),
            ClientEvent::DeleteChat(DeleteChatPayload {
                chat_id: sent.chat.id(),
            }),
        )
        .await;
    assert_eq!(drain(&mut e), vec![ServerEvent::error("Not allowed")]);

    h.engine
        .handle_event(
            origin(&a),
            ClientEvent::DeleteMessage(DeleteMessagePayload {
                message_id: MessageId::from(Uuid::new_v4()),
                chat_id: sent.chat.id(),
            }),
        )
        .await;
    assert_eq!(drain(&mut a), vec![ServerEvent::error("Failed to delete message")]);

    h.engine
        .handle_event(origin(&a), ClientEvent::SendMessage(send("", bob)))
        .await;
    assert_eq!(drain(&mut a), vec![ServerEvent::error("Failed to send message")]);

    assert!(drain(&mut b).is_empty());
}

#[tokio::test]
async fn send_message_surfaces_store_failure_without_emitting() {
    let mut chats = MockChats::new();
    chats
        .expect_find_or_create()
        .times(1)
        .returning(|_| -> RepositoryFuture<ChatDetails> {
            Box::pin(async { Err(RepositoryError::storage("pg down 10.0.0.5")) })
        });
    let h = Harness::with_chat_repository(Arc::new(chats));
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let mut a = h.connect(alice);

    let err = h
        .engine
        .send_message(origin(&a), send("hi", bob))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Repository(RepositoryError::Storage { .. })));
    assert!(drain(&mut a).is_empty());
}

#[tokio::test]
async fn store_failure_in_handler_is_reported_without_detail() {
    let mut chats = MockChats::new();
    chats
        .expect_find_or_create()
        .returning(|_| -> RepositoryFuture<ChatDetails> {
            Box::pin(async { Err(RepositoryError::storage("pg down 10.0.0.5")) })
        });
    let h = Harness::with_chat_repository(Arc::new(chats));
    let (alice, bob) = (h.user("alice").await, h.user("bob").await);
    let mut a = h.connect(alice);
    let mut b = h.connect(bob);

    h.engine
        .handle_event(origin(&a), ClientEvent::SendMessage(send("hi", bob)))
        .await;

    let to_alice = drain(&mut a);
    assert_eq!(to_alice, vec![ServerEvent::error("Failed to send message")]);
    let rendered = serde_json::to_string(&to_alice).unwrap();
    assert!(!rendered.contains("10.0.0.5"));
    assert!(!rendered.contains("pg down"));
    assert!(drain(&mut b).is_empty());
    assert_eq!(h.storage.message_count(), 0);
}
