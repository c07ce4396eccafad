// WebSocket endpoint: version-gated upgrade, then the socket pump.
//
// The pump multiplexes three concerns: frames from the connection's send
// queue (written under the write deadline), inbound client messages
// (subscribe / ping / pong), and the heartbeat timer (ping every
// ping_period, close when the pong is older than pong_wait). On normal
// close the remaining queue is drained under a deadline; every exit path
// releases the connection from the hub.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use memoro_core::hub::{
    parse_client_message, ClientMessage, WsEnvelope, CLOSE_VERSION_INCOMPATIBLE,
};
use std::time::Duration;

/// Header carrying the client protocol version.
const VERSION_HEADER: &str = "x-client-version";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let version = headers
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok());
    match state.hub.check_version(version) {
        Ok(v) => {
            debug!("[ws] Upgrade accepted (client version {})", v);
            let max_message = state.hub.config().max_message_bytes;
            ws.max_message_size(max_message)
                .on_upgrade(move |socket| handle_socket(socket, state))
        }
        Err(_) => {
            warn!("[ws] Upgrade rejected: incompatible client version {:?}", version);
            (StatusCode::UPGRADE_REQUIRED, CLOSE_VERSION_INCOMPATIBLE).into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection = state.hub.connect();
    let write_deadline = state.hub.write_deadline();
    let pong_wait = state.hub.pong_wait();
    let mut ping_timer = tokio::time::interval(state.hub.ping_period());
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let (mut sender, mut receiver) = socket.split();
    let mut normal_close = false;

    loop {
        tokio::select! {
            envelope = connection.queue().pop() => {
                if write_frame(&mut sender, &envelope, write_deadline).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match parse_client_message(&text) {
                            Ok(ClientMessage::Subscribe(request)) => {
                                if let Err(e) = state.hub.apply_subscription(&connection, request) {
                                    connection.queue().push(WsEnvelope::error(e.to_string(), None));
                                }
                            }
                            Ok(ClientMessage::Ping { request_id }) => {
                                let mut pong = WsEnvelope::pong();
                                pong.request_id = request_id;
                                connection.queue().push(pong);
                            }
                            Ok(ClientMessage::Pong) => connection.record_pong(),
                            Err(e) => {
                                connection.queue().push(WsEnvelope::error(e.to_string(), None));
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => connection.record_pong(),
                    Some(Ok(Message::Close(_))) | None => {
                        normal_close = true;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("[ws] Read error on {}: {}", connection.id, e);
                        break;
                    }
                }
            }
            _ = ping_timer.tick() => {
                if connection.pong_age() > pong_wait {
                    info!("[ws] {} missed its pong window — closing", connection.id);
                    break;
                }
                if write_frame(&mut sender, &WsEnvelope::ping(), write_deadline).await.is_err() {
                    break;
                }
            }
        }
    }

    // Normal close drains queued frames under one final deadline
    if normal_close {
        let drained = connection.queue().drain();
        let drain_until = tokio::time::Instant::now() + write_deadline;
        for envelope in drained {
            if tokio::time::Instant::now() >= drain_until {
                break;
            }
            if write_frame(&mut sender, &envelope, write_deadline).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    }

    state.hub.disconnect(&connection.id);
}

async fn write_frame(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    envelope: &WsEnvelope,
    deadline: Duration,
) -> Result<(), ()> {
    let text = serde_json::to_string(envelope).map_err(|_| ())?;
    match tokio::time::timeout(deadline, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("[ws] Write failed: {}", e);
            Err(())
        }
        Err(_) => {
            debug!("[ws] Write deadline ({}s) exceeded", deadline.as_secs());
            Err(())
        }
    }
}
