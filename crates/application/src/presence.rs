//! 进程内在线状态登记表
//!
//! 维护 `UserId -> {ConnectionId}` 映射。只在连接数 0→1、1→0 的边沿
//! 产生上线/下线信号，且信号与集合修改在同一把锁内计算。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use domain::UserId;
use uuid::Uuid;

/// 单条持久连接的标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    BecameOnline(UserId),
    BecameOffline(UserId),
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<UserId, HashSet<ConnectionId>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<UserId, HashSet<ConnectionId>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 重复登记同一连接不会再次产生信号。
    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<PresenceTransition> {
        let mut entries = self.entries();
        let connections = entries.entry(user_id).or_default();
        let was_empty = connections.is_empty();
        connections.insert(connection_id);
        was_empty.then_some(PresenceTransition::BecameOnline(user_id))
    }

    /// 最后一条连接移除时删除整个条目；未知用户或连接为空操作。
    pub fn unregister(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<PresenceTransition> {
        let mut entries = self.entries();
        let connections = entries.get_mut(&user_id)?;
        if !connections.remove(&connection_id) {
            return None;
        }
        if connections.is_empty() {
            entries.remove(&user_id);
            return Some(PresenceTransition::BecameOffline(user_id));
        }
        None
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.entries().contains_key(&user_id)
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.entries()
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.entries().keys().copied().collect()
    }
}
