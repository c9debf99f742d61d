// src/envelope.rs

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::MediaKind;

pub const BROADCAST_JID: &str = "status@broadcast";
const GROUP_SUFFIX: &str = "@g.us";
const BROADCAST_SUFFIX: &str = "@broadcast";

const WRAPPER_KEYS: [&str; 4] = [
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "documentWithCaptionMessage",
];
const MAX_UNWRAP_DEPTH: usize = 8;

pub const IMAGE_MARKER: &str = "[Imagem]";
pub const AUDIO_MARKER: &str = "[Áudio]";
pub const VIDEO_MARKER: &str = "[Vídeo]";
pub const DOCUMENT_MARKER: &str = "[Documento]";
pub const UNKNOWN_MARKER: &str = "[Mídia/Outro Tipo]";
const UNKNOWN_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: Option<String>,
    pub remote_jid_alt: Option<String>,
    pub participant: Option<String>,
    pub participant_alt: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    pub id: Option<String>,
}

/// A message event as delivered by the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaMessage {
    #[serde(default)]
    pub key: MessageKey,
    pub message: Option<Value>,
    pub message_timestamp: Option<Value>,
    pub push_name: Option<String>,
}

impl WaMessage {
    pub fn id(&self) -> &str {
        self.key.id.as_deref().unwrap_or("-")
    }

    pub fn remote_jid(&self) -> &str {
        self.key.remote_jid.as_deref().unwrap_or_default()
    }

    pub fn is_group(&self) -> bool {
        self.remote_jid().ends_with(GROUP_SUFFIX)
    }

    pub fn is_broadcast(&self) -> bool {
        let jid = self.remote_jid();
        jid == BROADCAST_JID || jid.ends_with(BROADCAST_SUFFIX)
    }

    /// Origin send time. Protocol timestamps are unix seconds, encoded as a number,
    /// a numeric string or a `{low, high}` long.
    pub fn origin_timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = match self.message_timestamp.as_ref()? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            Value::Object(long) => {
                let low = long.get("low")?.as_i64()? & 0xFFFF_FFFF;
                let high = long.get("high").and_then(Value::as_i64).unwrap_or(0);
                (high << 32) | low
            }
            _ => return None,
        };
        Utc.timestamp_opt(secs, 0).single()
    }
}

/// A downloadable attachment, still attached to the message node it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub mimetype: Option<String>,
    pub file_name: Option<String>,
    /// The unwrapped message map holding the media node (e.g. `{"imageMessage": {...}}`).
    pub message: Value,
}

impl MediaAttachment {
    pub fn node_key(&self) -> &'static str {
        node_key(self.kind)
    }

    pub fn node(&self) -> Option<&Value> {
        self.message.get(self.node_key())
    }
}

pub fn node_key(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "imageMessage",
        MediaKind::Audio => "audioMessage",
        MediaKind::Video => "videoMessage",
        MediaKind::Document => "documentMessage",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    Media {
        attachment: MediaAttachment,
        text: String,
    },
    Protocol,
    Unknown(String),
}

/// Peels ephemeral / view-once / caption wrappers until the real content is reached.
pub fn unwrap_message(message: &Value) -> Option<&Map<String, Value>> {
    let mut current = message.as_object()?;
    for _ in 0..MAX_UNWRAP_DEPTH {
        let inner = WRAPPER_KEYS
            .iter()
            .find_map(|key| current.get(*key))
            .map(|wrapper| wrapper.get("message"));
        match inner {
            Some(Some(next)) => current = next.as_object()?,
            Some(None) => return None,
            None => return Some(current),
        }
    }
    None
}

fn str_field<'a>(node: &'a Value, key: &str) -> Option<&'a str> {
    node.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn media(real: &Map<String, Value>, kind: MediaKind) -> Option<MessageBody> {
    let node = real.get(node_key(kind))?;
    let text = match kind {
        MediaKind::Image => str_field(node, "caption").unwrap_or(IMAGE_MARKER),
        MediaKind::Audio => AUDIO_MARKER,
        MediaKind::Video => str_field(node, "caption").unwrap_or(VIDEO_MARKER),
        MediaKind::Document => str_field(node, "title")
            .or_else(|| str_field(node, "fileName"))
            .unwrap_or(DOCUMENT_MARKER),
    };
    Some(MessageBody::Media {
        attachment: MediaAttachment {
            kind,
            mimetype: str_field(node, "mimetype").map(str::to_string),
            file_name: str_field(node, "fileName")
                .or_else(|| str_field(node, "title"))
                .map(str::to_string),
            message: Value::Object(real.clone()),
        },
        text: text.to_string(),
    })
}

/// Classifies a raw `message` payload. `None` means nothing usable was found.
pub fn classify(message: &Value) -> Option<MessageBody> {
    let real = unwrap_message(message)?;
    if real.is_empty() {
        return None;
    }

    if let Some(text) = real.get("conversation").and_then(Value::as_str) {
        return Some(MessageBody::Text(text.to_string()));
    }
    if let Some(ext) = real.get("extendedTextMessage") {
        return Some(MessageBody::Text(
            str_field(ext, "text").unwrap_or_default().to_string(),
        ));
    }
    for kind in [
        MediaKind::Image,
        MediaKind::Audio,
        MediaKind::Video,
        MediaKind::Document,
    ] {
        if let Some(body) = media(real, kind) {
            return Some(body);
        }
    }
    if real.contains_key("protocolMessage") {
        return Some(MessageBody::Protocol);
    }

    let mut preview: String = Value::Object(real.clone())
        .to_string()
        .chars()
        .take(UNKNOWN_PREVIEW_CHARS)
        .collect();
    if preview.is_empty() || preview == "{}" {
        preview = UNKNOWN_MARKER.to_string();
    } else {
        preview.push_str("...");
    }
    Some(MessageBody::Unknown(preview))
}
