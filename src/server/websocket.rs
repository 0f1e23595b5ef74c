//! WebSocket 事件推送
//!
//! 连接建立后先推送 `connected` 和当前任务快照，之后原样转发登记器事件。

use crate::registry::{RegistryEvent, TaskHandle, TaskSnapshot};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 服务端连接级消息（任务事件之外）
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Connected { connection_id: String, version: String },
    Snapshot { tasks: Vec<TaskSnapshot> },
    /// 客户端消费过慢，丢弃了部分事件，应重新拉取列表
    Lagged { skipped: u64 },
}

/// WebSocket 路由处理器
///
/// GET /api/v1/ws
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, message: &T) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("序列化消息失败: {}", e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    // 先订阅再取快照，避免漏掉中间的事件
    let mut events = state.registry.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let connected = WsServerMessage::Connected {
        connection_id: connection_id.clone(),
        version: crate::registry::VERSION.to_string(),
    };
    if !send_json(&mut sender, &connected).await {
        error!("发送连接成功消息失败: {}", connection_id);
        return;
    }

    let tasks = match state.registry.list_tasks("").await {
        Ok(view) => view.iter().map(TaskHandle::snapshot).collect(),
        Err(e) => {
            warn!("获取任务快照失败: {}", e);
            Vec::new()
        }
    };
    if !send_json(&mut sender, &WsServerMessage::Snapshot { tasks }).await {
        return;
    }

    let send_conn_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let sent = match events.recv().await {
                Ok(event) => send_json::<RegistryEvent>(&mut sender, &event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket 连接 {} 丢弃了 {} 个事件", send_conn_id, skipped);
                    send_json(&mut sender, &WsServerMessage::Lagged { skipped }).await
                }
                Err(RecvError::Closed) => break,
            };
            if !sent {
                break;
            }
        }
    });

    let recv_conn_id = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Close(_) => {
                    info!("收到关闭消息: {}", recv_conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("收到心跳: {}", recv_conn_id);
                }
                Message::Text(_) | Message::Binary(_) => {
                    debug!("忽略客户端消息: {}", recv_conn_id);
                }
            }
        }
    });

    // 任一任务结束即关闭另一个
    let mut send_task = send_task;
    let mut recv_task = recv_task;
    tokio::select! {
        _ = &mut send_task => {
            debug!("发送任务结束: {}", connection_id);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("接收任务结束: {}", connection_id);
            send_task.abort();
        }
    }

    info!("WebSocket 连接已关闭: {}", connection_id);
}
