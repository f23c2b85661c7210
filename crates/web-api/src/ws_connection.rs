use std::sync::Arc;
use std::time::Duration;

use application::{
    ClientEvent, ConnectionHub, ConversationEngine, EventBroadcaster, EventOrigin, Principal,
    ServerEvent,
};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::state::AppState;

/// 单条 WebSocket 连接
///
/// 生命周期：
/// - 在连接中心登记（在线状态与私有通道）
/// - 发送任务转发出站事件并定时发送 Ping
/// - 接收任务解析入站事件，每个事件在独立任务中交给会话引擎
/// - 任一任务结束后执行断开流程
pub struct WebSocketConnection {
    state: AppState,
    principal: Principal,
}

impl WebSocketConnection {
    pub fn new(state: AppState, principal: Principal) -> Self {
        Self { state, principal }
    }

    pub async fn run(self, socket: WebSocket) {
        let handle = self.state.hub.connect(self.principal.user_id);
        let connection_id = handle.id;
        let user_id = handle.user_id;
        let mut outbound = handle.receiver;
        tracing::info!(
            user_id = %user_id,
            connection_id = %connection_id,
            connections = self.state.hub.connection_count(),
            "websocket connected"
        );

        let ping_every = Duration::from_secs(self.state.realtime.ping_interval_secs);
        let liveness = Duration::from_secs(self.state.realtime.liveness_timeout_secs);
        let (mut sender, mut incoming) = socket.split();

        // 所有对 sender 的写操作都经过发送任务
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendPong(data) => WsMessage::Pong(data),
                        WsCommand::Close => {
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    event = outbound.recv() => match event {
                        Some(event) => match serde_json::to_string(&event) {
                            Ok(json) => WsMessage::Text(json.into()),
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to serialize websocket payload");
                                continue;
                            }
                        },
                        None => break,
                    },
                    _ = ticker.tick() => WsMessage::Ping(Bytes::new()),
                };

                if sender.send(frame).await.is_err() {
                    tracing::debug!("websocket sink closed");
                    break;
                }
            }
        });

        let engine = self.state.engine.clone();
        let hub = self.state.hub.clone();
        let origin = EventOrigin::new(self.principal, connection_id);

        let mut recv_task = tokio::spawn(async move {
            loop {
                // 任何入站帧都视为存活
                let message = match timeout(liveness, incoming.next()).await {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(err))) => {
                        tracing::debug!(error = %err, "websocket read failed");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::info!(connection_id = %origin.connection_id, "liveness timeout");
                        break;
                    }
                };

                match message {
                    WsMessage::Text(text) => Self::dispatch(&engine, &hub, origin, text.as_str()),
                    WsMessage::Binary(_) => {
                        tracing::debug!("ignoring binary frame");
                    }
                    WsMessage::Ping(data) => {
                        if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => {
                        tracing::debug!("client closed websocket");
                        break;
                    }
                }
            }
            let _ = cmd_tx.send(WsCommand::Close).await;
        });

        tokio::select! {
            _ = &mut send_task => {
                recv_task.abort();
            }
            _ = &mut recv_task => {
                // 留出时间让关闭帧写出
                if timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
                    send_task.abort();
                }
            }
        }

        self.state.hub.disconnect(user_id, connection_id);
        tracing::info!(
            user_id = %user_id,
            connection_id = %connection_id,
            connections = self.state.hub.connection_count(),
            "websocket disconnected"
        );
    }

    /// 解析失败只通知本连接；解析成功的事件在独立任务中处理。
    fn dispatch(
        engine: &Arc<ConversationEngine>,
        hub: &Arc<ConnectionHub>,
        origin: EventOrigin,
        text: &str,
    ) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => {
                tracing::debug!(event = event.name(), user_id = %origin.user_id(), "event received");
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.handle_event(origin, event).await;
                });
            }
            Err(err) => {
                tracing::debug!(error = %err, connection_id = %origin.connection_id, "malformed event frame");
                if let Err(err) =
                    hub.to_connection(origin.connection_id, ServerEvent::error("Invalid event payload"))
                {
                    tracing::warn!(error = %err, "failed to report malformed frame");
                }
            }
        }
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Bytes),
    Close,
}
