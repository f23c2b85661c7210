//! 连接中心
//!
//! 每条连接持有一个有界出站队列；用户的私有通道即该用户在
//! `PresenceRegistry` 中登记的全部连接。上线/下线广播与登记表修改在同一
//! 把生命周期锁内完成，保证所有连接看到的在线状态事件顺序一致。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use config::RealtimeConfig;
use domain::UserId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::broadcaster::{BroadcastError, EventBroadcaster};
use crate::events::ServerEvent;
use crate::presence::{ConnectionId, PresenceRegistry, PresenceTransition};

struct ConnectionEntry {
    user_id: UserId,
    sender: mpsc::Sender<ServerEvent>,
}

/// 新连接接入后交给传输层的句柄，`receiver` 即该连接的出站事件流。
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub receiver: mpsc::Receiver<ServerEvent>,
}

pub struct ConnectionHub {
    presence: Arc<PresenceRegistry>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    lifecycle: Mutex<()>,
    outbound_buffer: usize,
}

impl ConnectionHub {
    pub fn new(presence: Arc<PresenceRegistry>, outbound_buffer: usize) -> Self {
        Self {
            presence,
            connections: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    pub fn from_config(presence: Arc<PresenceRegistry>, config: &RealtimeConfig) -> Self {
        Self::new(presence, config.outbound_buffer)
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// 登记一条新连接。
    ///
    /// 新连接先收到当前已在线用户的状态，然后若本用户由离线变为在线，
    /// 向所有连接（包括新连接自身）广播上线事件。
    pub fn connect(&self, user_id: UserId) -> ConnectionHandle {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.outbound_buffer);

        for online in self.presence.online_users() {
            if online == user_id {
                continue;
            }
            if sender.try_send(ServerEvent::presence(online, true)).is_err() {
                warn!(connection_id = %id, "presence seed truncated, outbound queue full");
                break;
            }
        }

        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ConnectionEntry { user_id, sender });

        if let Some(PresenceTransition::BecameOnline(user_id)) = self.presence.register(user_id, id)
        {
            let delivered = self.to_everyone(ServerEvent::presence(user_id, true));
            info!(user_id = %user_id, delivered, "user online");
        }
        debug!(user_id = %user_id, connection_id = %id, "connection registered");

        ConnectionHandle {
            id,
            user_id,
            receiver,
        }
    }

    /// 移除连接；用户最后一条连接断开时广播下线事件。未知连接为空操作。
    pub fn disconnect(&self, user_id: UserId, connection_id: ConnectionId) {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id);

        if let Some(PresenceTransition::BecameOffline(user_id)) =
            self.presence.unregister(user_id, connection_id)
        {
            let delivered = self.to_everyone(ServerEvent::presence(user_id, false));
            info!(user_id = %user_id, delivered, "user offline");
        }
        debug!(user_id = %user_id, connection_id = %connection_id, "connection removed");
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn deliver(
        connection_id: ConnectionId,
        entry: &ConnectionEntry,
        event: ServerEvent,
    ) -> Result<(), BroadcastError> {
        match entry.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection_id,
                    user_id = %entry.user_id,
                    "outbound queue full, dropping event"
                );
                Err(BroadcastError::QueueFull(connection_id))
            }
            Err(TrySendError::Closed(_)) => Err(BroadcastError::Closed(connection_id)),
        }
    }
}

impl EventBroadcaster for ConnectionHub {
    fn to_connection(
        &self,
        connection_id: ConnectionId,
        event: ServerEvent,
    ) -> Result<(), BroadcastError> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = connections
            .get(&connection_id)
            .ok_or(BroadcastError::UnknownConnection(connection_id))?;
        Self::deliver(connection_id, entry, event)
    }

    fn to_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        let targets = self.presence.connections_of(user_id);
        if targets.is_empty() {
            return 0;
        }
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        targets
            .into_iter()
            .filter_map(|id| connections.get(&id).map(|entry| (id, entry)))
            .filter(|(id, entry)| Self::deliver(*id, entry, event.clone()).is_ok())
            .count()
    }

    fn to_everyone(&self, event: ServerEvent) -> usize {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections
            .iter()
            .filter(|(id, entry)| Self::deliver(**id, entry, event.clone()).is_ok())
            .count()
    }
}
