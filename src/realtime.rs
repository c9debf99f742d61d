// src/realtime.rs

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::models::Message;
use crate::supervisor::{ConnectionStatus, SessionState};

const CHANNEL_CAPACITY: usize = 256;

/// Frames pushed to dashboard subscribers as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    WhatsappStatus(ConnectionStatus),
    WhatsappQr(Option<String>),
    NewMessage(Message),
    MessageUpdated(Message),
}

/// Fan-out to every connected subscriber. At most once per subscriber, no replay.
#[derive(Clone)]
pub struct RealtimeBroadcaster {
    events: broadcast::Sender<RealtimeEvent>,
    session: watch::Receiver<SessionState>,
}

pub struct Subscription {
    /// Current status, plus the pending QR if there is one.
    pub snapshot: Vec<RealtimeEvent>,
    pub events: broadcast::Receiver<RealtimeEvent>,
}

impl RealtimeBroadcaster {
    pub fn new(session: watch::Receiver<SessionState>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { events, session }
    }

    pub fn subscribe(&self) -> Subscription {
        // subscribe before reading the snapshot so nothing falls in between
        let events = self.events.subscribe();
        let state = self.session.borrow().clone();

        let mut snapshot = vec![RealtimeEvent::WhatsappStatus(state.status)];
        if state.qr.is_some() {
            snapshot.push(RealtimeEvent::WhatsappQr(state.qr));
        }
        Subscription { snapshot, events }
    }

    pub fn publish(&self, event: RealtimeEvent) {
        // Err only means nobody is listening
        if let Ok(n) = self.events.send(event) {
            tracing::trace!(subscribers = n, "realtime event published");
        }
    }

    pub fn status(&self, status: ConnectionStatus) {
        self.publish(RealtimeEvent::WhatsappStatus(status));
    }

    pub fn qr(&self, qr: Option<String>) {
        self.publish(RealtimeEvent::WhatsappQr(qr));
    }

    pub fn new_message(&self, message: &Message) {
        self.publish(RealtimeEvent::NewMessage(message.clone()));
    }

    pub fn message_updated(&self, message: &Message) {
        self.publish(RealtimeEvent::MessageUpdated(message.clone()));
    }
}
