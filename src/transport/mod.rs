//! Contract between the gateway and the chat-protocol connection.
//!
//! The transport is an event source (connection updates, message batches, contact
//! sync) and a command sink (send text, profile photo lookup, media download). The
//! pairing/QR lifecycle of the protocol itself lives behind this trait.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::WaMessage;

pub mod bridge;

pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";
pub const LID_SUFFIX: &str = "@lid";

pub fn user_jid(phone_digits: &str) -> String {
    format!("{phone_digits}{USER_JID_SUFFIX}")
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport request `{0}` timed out")]
    Timeout(String),
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport protocol error: {0}")]
    Protocol(String),
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Contact {
    /// Phone-keyed id, e.g. `5511987654321@s.whatsapp.net`.
    pub id: String,
    /// Anonymized id, e.g. `123456789012345@lid`.
    pub lid: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection {
        state: Option<ConnectionState>,
        qr: Option<String>,
        /// Close reason as reported by the protocol (HTTP-like status codes).
        status_code: Option<u16>,
    },
    Messages(Vec<WaMessage>),
    Contacts(Vec<Contact>),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts a connection attempt. Events for this attempt are pushed into `events`
    /// until the connection closes or `end` is called.
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError>;

    async fn send_text(&self, jid: &str, text: &str) -> Result<(), TransportError>;

    /// `Ok(None)` when the contact has no photo or keeps it private.
    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, TransportError>;

    /// Downloads a media payload. `envelope` is `{"message": {...}}` around the media node.
    async fn download_media(&self, envelope: &Value) -> Result<Vec<u8>, TransportError>;

    /// Logs the linked device out on the server side.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Drops the current connection without touching credentials.
    async fn end(&self);
}
