//! Message content as it lives in the `messages.content` text column.
//!
//! Media messages are stored as a JSON placeholder serialized to text
//! (`{"type","url","text","isMedia","status"}`) while the column type stays `text`,
//! which is what the dashboard already knows how to render. This module is the only
//! place that encodes or decodes that shape.

use serde::{Deserialize, Serialize, Serializer};

use crate::models::{MediaKind, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Uploading,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPlaceholder {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: Option<String>,
    #[serde(rename = "text")]
    pub caption: String,
    #[serde(rename = "isMedia")]
    pub is_media: bool,
    pub status: MediaStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Media(MediaPlaceholder),
}

impl MessageContent {
    pub fn uploading(kind: MediaKind, caption: impl Into<String>) -> Self {
        MessageContent::Media(MediaPlaceholder {
            kind,
            url: None,
            caption: caption.into(),
            is_media: true,
            status: MediaStatus::Uploading,
        })
    }

    /// The same placeholder, now pointing at its uploaded object.
    pub fn with_url(&self, url: String) -> Option<Self> {
        match self {
            MessageContent::Media(p) => Some(MessageContent::Media(MediaPlaceholder {
                url: Some(url),
                status: MediaStatus::Ready,
                ..p.clone()
            })),
            MessageContent::Text(_) => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::Text(_) => MessageType::Text,
            MessageContent::Media(p) => p.kind.into(),
        }
    }

    /// Short human text for conversation list previews.
    pub fn preview(&self) -> &str {
        match self {
            MessageContent::Text(t) => t,
            MessageContent::Media(p) => &p.caption,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            // infallible for this shape
            MessageContent::Media(p) => serde_json::to_string(p).unwrap_or_default(),
        }
    }

    pub fn decode(raw: &str) -> Self {
        if raw.trim_start().starts_with('{') {
            if let Ok(p) = serde_json::from_str::<MediaPlaceholder>(raw) {
                if p.is_media {
                    return MessageContent::Media(p);
                }
            }
        }
        MessageContent::Text(raw.to_string())
    }
}

pub fn serialize_as_text<S: Serializer>(content: &MessageContent, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&content.encode())
}
