// src/store.rs
//
// Persistence contract over the four collections the gateway touches.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::content::MessageContent;
use crate::models::{
    Channel, Conversation, LeadStatus, Message, MessageStatus, MessageType, Patient, SenderType,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
    #[error("db error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct NewPatient {
    pub clinic_id: Uuid,
    pub name: String,
    pub phone: String,
    pub channel: Channel,
    pub lead_status: LeadStatus,
    pub avatar_url: Option<String>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub estimated_value: Option<f64>,
}

impl NewPatient {
    /// A lead first seen on WhatsApp.
    pub fn whatsapp_lead(clinic_id: Uuid, name: String, phone: String) -> Self {
        Self {
            clinic_id,
            name,
            phone,
            channel: Channel::Whatsapp,
            lead_status: LeadStatus::New,
            avatar_url: None,
            tags: Vec::new(),
            notes: None,
            estimated_value: None,
        }
    }
}

/// Field-level patch; `None` leaves the column untouched. Nullable columns use a
/// nested option so `Some(None)` clears them.
#[derive(Debug, Clone, Default)]
pub struct PatientPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub channel: Option<Channel>,
    pub lead_status: Option<LeadStatus>,
    pub avatar_url: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<Option<String>>,
    pub estimated_value: Option<Option<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct PatientFilter {
    pub query: Option<String>,
    pub lead_status: Option<LeadStatus>,
    pub channel: Option<Channel>,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub channel: Channel,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i32,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_type: SenderType,
    pub sender_id: Option<Uuid>,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // clinics
    async fn first_clinic_id(&self) -> Result<Option<Uuid>, StoreError>;

    // patients
    async fn find_patient_by_phones(
        &self,
        clinic_id: Uuid,
        channel: Channel,
        phones: &[String],
    ) -> Result<Option<Patient>, StoreError>;
    /// Case-insensitive exact name match, newest first.
    async fn find_patient_by_name(
        &self,
        clinic_id: Uuid,
        name: &str,
    ) -> Result<Option<Patient>, StoreError>;
    async fn insert_patient(&self, new: NewPatient) -> Result<Patient, StoreError>;
    async fn get_patient(&self, clinic_id: Uuid, id: Uuid) -> Result<Option<Patient>, StoreError>;
    async fn list_patients(
        &self,
        clinic_id: Uuid,
        filter: &PatientFilter,
    ) -> Result<Vec<Patient>, StoreError>;
    async fn update_patient(
        &self,
        clinic_id: Uuid,
        id: Uuid,
        patch: PatientPatch,
    ) -> Result<Option<Patient>, StoreError>;
    async fn set_patient_avatar(&self, id: Uuid, url: &str) -> Result<(), StoreError>;
    /// Returns how many patients were updated.
    async fn set_avatar_by_phone(&self, phones: &[String], url: &str) -> Result<u64, StoreError>;
    /// Deletes the patient together with its conversations and their messages.
    async fn delete_patient(&self, clinic_id: Uuid, id: Uuid) -> Result<bool, StoreError>;

    // conversations
    async fn find_conversation(
        &self,
        clinic_id: Uuid,
        patient_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Conversation>, StoreError>;
    /// Conditional insert on (clinic_id, patient_id, channel): returns `None` when a
    /// concurrent writer already created the row.
    async fn insert_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Option<Conversation>, StoreError>;
    /// Core aggregate update: sets `last_message_at` and adds `unread_delta` atomically.
    async fn touch_conversation(
        &self,
        id: Uuid,
        last_message_at: DateTime<Utc>,
        unread_delta: i32,
    ) -> Result<(), StoreError>;
    /// Preview columns; callers treat failures as non-critical.
    async fn set_conversation_preview(
        &self,
        id: Uuid,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), StoreError>;
    async fn mark_conversation_read(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;
    async fn list_conversations(&self, clinic_id: Uuid) -> Result<Vec<Conversation>, StoreError>;
    async fn delete_conversation(&self, clinic_id: Uuid, id: Uuid) -> Result<bool, StoreError>;

    // messages
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError>;
    /// One-shot enrichment of a media placeholder.
    async fn update_message_content(
        &self,
        id: Uuid,
        content: &MessageContent,
    ) -> Result<Option<Message>, StoreError>;
    /// Ordered by origin timestamp, oldest first.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;
}

/// Runs a non-critical side effect: failures are logged under `label` and never
/// propagated to the caller.
pub async fn best_effort<T, E, F>(label: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(side_effect = label, error = %e, "non-critical write failed");
            None
        }
    }
}
