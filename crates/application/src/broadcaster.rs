use domain::UserId;
use thiserror::Error;

use crate::events::ServerEvent;
use crate::presence::ConnectionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("outbound queue of connection {0} is full")]
    QueueFull(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// 对外推送事件的原语。实现方决定事件如何到达具体连接。
pub trait EventBroadcaster: Send + Sync {
    /// 只发往一条连接。
    fn to_connection(
        &self,
        connection_id: ConnectionId,
        event: ServerEvent,
    ) -> Result<(), BroadcastError>;

    /// 发往用户的私有通道（该用户的全部在线连接），返回成功投递的连接数。
    fn to_user(&self, user_id: UserId, event: ServerEvent) -> usize;

    /// 发往所有在线连接。
    fn to_everyone(&self, event: ServerEvent) -> usize;
}
