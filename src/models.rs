use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::{self, MessageContent};
use crate::phone::PhoneNormalizer;
use crate::realtime::RealtimeBroadcaster;
use crate::store::Store;
use crate::supervisor::SupervisorHandle;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub supervisor: SupervisorHandle,
    pub realtime: RealtimeBroadcaster,
    pub phones: PhoneNormalizer,
    pub default_clinic_id: Option<Uuid>,
}

/* -------------------------
   Enumerations
--------------------------*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Text-backed enum: serde, `Display`, `FromStr` and the database string all agree.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }
    };
}

text_enum!(Channel {
    Whatsapp => "whatsapp",
    Instagram => "instagram",
    Facebook => "facebook",
    Website => "website",
});

// Set directly by dashboard users; ingestion only ever writes `New`.
text_enum!(LeadStatus {
    New => "new",
    Contacted => "contacted",
    Qualified => "qualified",
    Scheduled => "scheduled",
    Treatment => "treatment",
    Converted => "converted",
    Lost => "lost",
});

text_enum!(SenderType {
    Patient => "patient",
    Attendant => "attendant",
    System => "system",
});

text_enum!(MessageStatus {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

text_enum!(MessageType {
    Text => "text",
    Image => "image",
    Audio => "audio",
    Video => "video",
    Document => "document",
});

text_enum!(MediaKind {
    Image => "image",
    Audio => "audio",
    Video => "video",
    Document => "document",
});

impl From<MediaKind> for MessageType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => MessageType::Image,
            MediaKind::Audio => MessageType::Audio,
            MediaKind::Video => MessageType::Video,
            MediaKind::Document => MessageType::Document,
        }
    }
}

/* -------------------------
   Domain rows
--------------------------*/

#[derive(Debug, Clone, Serialize)]
pub struct Patient {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub phone: String,
    pub channel: Channel,
    pub lead_status: LeadStatus,
    pub avatar_url: Option<String>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub estimated_value: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub channel: Channel,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i32,
    pub last_message_content: Option<String>,
    pub last_message_type: Option<MessageType>,
    pub is_active: bool,
}

/// Immutable ledger entry. `message_type` is always `Text` at the storage layer;
/// media metadata travels inside `content`.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_type: SenderType,
    pub sender_id: Option<Uuid>,
    #[serde(serialize_with = "content::serialize_as_text")]
    pub content: MessageContent,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}
