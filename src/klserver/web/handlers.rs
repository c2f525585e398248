use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::server::GatewayState;
use crate::klcommon::{CandleMessage, CandleMessageType};

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeParams {
    /// 逗号分隔的频道列表，例如 `candle:BTCUSDT:5m,price:BTCUSDT`
    pub channels: Option<String>,
}

/// 客户端在连接建立后发送的控制消息
#[derive(Debug, Default, Deserialize)]
pub struct ControlMessage {
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub unsubscribe: Vec<String>,
}

pub fn parse_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// 推送给客户端的帧：`{"channel": ..., "data": <原始消息>}`
pub fn frame(channel: &str, payload: &str) -> String {
    let channel = serde_json::Value::String(channel.to_string());
    format!("{{\"channel\":{},\"data\":{}}}", channel, payload)
}

/// WebSocket升级处理器
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    let initial = params.channels.as_deref().map(parse_channels).unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, initial))
}

/// 处理单个WebSocket连接的生命周期
async fn handle_socket(mut socket: WebSocket, state: GatewayState, initial: Vec<String>) {
    // 先订阅广播再发快照，保证快照之后的更新不会漏掉
    let mut updates = state.publisher.subscribe();
    let mut channels: HashSet<String> = HashSet::new();

    if !subscribe(&mut socket, &state, &mut channels, initial).await {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(message) => {
                    if channels.contains(&message.channel)
                        && socket.send(Message::Text(frame(&message.channel, &message.payload))).await.is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "WebServer", skipped, "订阅者处理过慢，丢弃了部分消息");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let control = match serde_json::from_str::<ControlMessage>(&text) {
                        Ok(control) => control,
                        Err(e) => {
                            debug!(target: "WebServer", error = %e, "忽略无法解析的客户端消息");
                            continue;
                        }
                    };
                    for channel in &control.unsubscribe {
                        channels.remove(channel);
                    }
                    if !subscribe(&mut socket, &state, &mut channels, control.subscribe).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(target: "WebServer", channel_count = channels.len(), "客户端断开");
}

/// 加入新频道，并对K线频道发送缓存中的当前K线作为快照
///
/// 发送失败（客户端已断开）时返回 false
async fn subscribe(
    socket: &mut WebSocket,
    state: &GatewayState,
    channels: &mut HashSet<String>,
    requested: Vec<String>,
) -> bool {
    for channel in requested {
        if !channels.insert(channel.clone()) {
            continue;
        }
        info!(target: "WebServer", channel = %channel, "请求订阅");

        let Some(snapshot) = snapshot_for(state, &channel) else {
            continue;
        };
        if socket.send(Message::Text(frame(&channel, &snapshot))).await.is_err() {
            return false;
        }
    }
    true
}

fn snapshot_for(state: &GatewayState, channel: &str) -> Option<String> {
    let mut parts = channel.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("candle"), Some(symbol), Some(timeframe), None) => {
            let candle = state.live_cache.get(symbol, timeframe)?;
            serde_json::to_string(&CandleMessage::new(CandleMessageType::Live, &candle)).ok()
        }
        _ => None,
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscribers: usize,
    pub live_candles: usize,
}

pub async fn health_handler(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        subscribers: state.publisher.subscriber_count(),
        live_candles: state.live_cache.len(),
    })
}
