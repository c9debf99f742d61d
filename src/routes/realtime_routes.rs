// src/routes/realtime_routes.rs

use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::models::AppState;
use crate::realtime::{RealtimeEvent, Subscription};

const HEARTBEAT: Duration = Duration::from_secs(25);

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    // subscribe before the handshake completes so the snapshot is current
    let subscription = state.realtime.subscribe();
    ws.on_upgrade(move |socket| run_connection(socket, subscription))
}

fn frame(event: &RealtimeEvent) -> Option<WsMessage> {
    match serde_json::to_string(event) {
        Ok(raw) => Some(WsMessage::Text(raw.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize realtime event");
            None
        }
    }
}

async fn run_connection(socket: WebSocket, subscription: Subscription) {
    let Subscription {
        snapshot,
        mut events,
    } = subscription;
    let (mut sender, mut receiver) = socket.split();
    tracing::info!("dashboard subscriber connected");

    for event in &snapshot {
        if let Some(msg) = frame(event) {
            if sender.send(msg).await.is_err() {
                return;
            }
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(msg) = frame(&event) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Ping(payload))) => {
                    if sender.send(WsMessage::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                // subscribe-only channel
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("dashboard subscriber disconnected");
}
