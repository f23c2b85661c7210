use std::sync::Arc;

use application::{
    Clock, ConnectionHub, ConversationEngine, ConversationEngineDependencies, PresenceRegistry,
    SystemClock, UserService, UserServiceDependencies,
};
use config::{AppConfig, RealtimeConfig};
use infrastructure::Infrastructure;

use crate::auth::AuthGate;

#[derive(Clone)]
pub struct AppState {
    pub user_service: Arc<UserService>,
    pub engine: Arc<ConversationEngine>,
    pub hub: Arc<ConnectionHub>,
    pub auth_gate: Arc<AuthGate>,
    pub realtime: RealtimeConfig,
}

impl AppState {
    /// 由基础设施适配器组装全部用例服务；连接中心同时作为会话引擎的推送端。
    pub fn new(config: &AppConfig, infrastructure: Infrastructure) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let presence = Arc::new(PresenceRegistry::new());
        let hub = Arc::new(ConnectionHub::from_config(presence, &config.realtime));

        let engine = ConversationEngine::new(ConversationEngineDependencies {
            user_repository: infrastructure.user_repository.clone(),
            chat_repository: infrastructure.chat_repository.clone(),
            message_repository: infrastructure.message_repository.clone(),
            broadcaster: hub.clone(),
            clock: clock.clone(),
        });
        let user_service = UserService::new(UserServiceDependencies {
            user_repository: infrastructure.user_repository,
            password_hasher: infrastructure.password_hasher,
            token_service: infrastructure.token_service.clone(),
            clock,
        });
        let auth_gate = AuthGate::new(infrastructure.token_service, &config.jwt);

        Self {
            user_service: Arc::new(user_service),
            engine: Arc::new(engine),
            hub,
            auth_gate: Arc::new(auth_gate),
            realtime: config.realtime.clone(),
        }
    }
}
