//! Per-message ingestion: filter, classify, resolve the patient, keep the
//! conversation aggregates current, persist the message and announce it.
//!
//! The message row is written before any media transfer starts, with a placeholder
//! the dashboard renders as "uploading". Once the offload finishes the placeholder is
//! patched with its public URL and a `message_updated` event follows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::content::MessageContent;
use crate::envelope::{MediaAttachment, MessageBody, WaMessage, classify};
use crate::identity::{IdentityResolver, ResolveError, TransportIdentity};
use crate::media::MediaOffloader;
use crate::models::{Channel, Conversation, Message, MessageStatus, SenderType};
use crate::realtime::RealtimeBroadcaster;
use crate::store::{NewConversation, NewMessage, Store, StoreError, best_effort};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoPayload,
    Broadcast,
    Group,
    Protocol,
    Empty,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Skipped(SkipReason),
    Stored(Message),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("no clinic available to own the conversation")]
    NoClinic,
    #[error("clinic lookup failed: {0}")]
    Clinic(StoreError),
    #[error("identity resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("conversation write failed: {0}")]
    Conversation(StoreError),
    #[error("message insert failed: {0}")]
    Message(StoreError),
}

#[derive(Clone)]
pub struct MessageIngester {
    store: Arc<dyn Store>,
    resolver: IdentityResolver,
    media: MediaOffloader,
    realtime: RealtimeBroadcaster,
    clinic_id: Option<Uuid>,
}

impl MessageIngester {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: IdentityResolver,
        media: MediaOffloader,
        realtime: RealtimeBroadcaster,
        clinic_id: Option<Uuid>,
    ) -> Self {
        Self {
            store,
            resolver,
            media,
            realtime,
            clinic_id,
        }
    }

    pub async fn ingest(&self, msg: WaMessage) -> Result<IngestOutcome, IngestError> {
        let Some(payload) = msg.message.as_ref() else {
            return Ok(IngestOutcome::Skipped(SkipReason::NoPayload));
        };
        if msg.is_broadcast() {
            return Ok(IngestOutcome::Skipped(SkipReason::Broadcast));
        }
        if msg.is_group() {
            return Ok(IngestOutcome::Skipped(SkipReason::Group));
        }

        let (content, attachment) = match classify(payload) {
            None => return Ok(IngestOutcome::Skipped(SkipReason::Empty)),
            Some(MessageBody::Protocol) => return Ok(IngestOutcome::Skipped(SkipReason::Protocol)),
            Some(MessageBody::Text(t)) | Some(MessageBody::Unknown(t)) => {
                if t.trim().is_empty() {
                    return Ok(IngestOutcome::Skipped(SkipReason::Empty));
                }
                (MessageContent::Text(t), None)
            }
            Some(MessageBody::Media { attachment, text }) => (
                MessageContent::uploading(attachment.kind, text),
                Some(attachment),
            ),
        };

        let clinic_id = self.clinic_id().await?;
        let outbound = msg.key.from_me;

        let patient = self
            .resolver
            .resolve(
                clinic_id,
                &TransportIdentity::from(&msg.key),
                msg.push_name.as_deref(),
                outbound,
            )
            .await?;

        let created_at = msg.origin_timestamp().unwrap_or_else(|| {
            tracing::warn!(message_id = msg.id(), "message has no timestamp, using ingestion time");
            Utc::now()
        });

        let conversation = self
            .touch_conversation(clinic_id, patient.id, created_at, outbound)
            .await
            .map_err(IngestError::Conversation)?;

        best_effort(
            "conversation_preview",
            self.store.set_conversation_preview(
                conversation.id,
                content.preview(),
                content.message_type(),
            ),
        )
        .await;

        let new = NewMessage {
            conversation_id: conversation.id,
            sender_type: if outbound {
                SenderType::Attendant
            } else {
                SenderType::Patient
            },
            // patient-origin rows carry no sender; attendant sends from the phone have no user id
            sender_id: None,
            content,
            status: if outbound {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            },
            created_at,
        };
        let saved = self
            .store
            .insert_message(new)
            .await
            .map_err(IngestError::Message)?;

        tracing::info!(
            message_id = msg.id(),
            patient_id = %patient.id,
            conversation_id = %conversation.id,
            outbound,
            kind = %saved.content.message_type(),
            "message stored"
        );
        self.realtime.new_message(&saved);

        let stored = match attachment {
            Some(attachment) => self.enrich(saved, &attachment, msg.id()).await,
            None => saved,
        };
        Ok(IngestOutcome::Stored(stored))
    }

    async fn clinic_id(&self) -> Result<Uuid, IngestError> {
        if let Some(id) = self.clinic_id {
            return Ok(id);
        }
        match self.store.first_clinic_id().await {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(IngestError::NoClinic),
            Err(e) => Err(IngestError::Clinic(e)),
        }
    }

    /// Finds or creates the thread and bumps its core aggregates.
    async fn touch_conversation(
        &self,
        clinic_id: Uuid,
        patient_id: Uuid,
        at: DateTime<Utc>,
        outbound: bool,
    ) -> Result<Conversation, StoreError> {
        let unread_delta = if outbound { 0 } else { 1 };

        if let Some(conv) = self
            .store
            .find_conversation(clinic_id, patient_id, Channel::Whatsapp)
            .await?
        {
            self.store.touch_conversation(conv.id, at, unread_delta).await?;
            return Ok(conv);
        }

        let created = self
            .store
            .insert_conversation(NewConversation {
                clinic_id,
                patient_id,
                channel: Channel::Whatsapp,
                last_message_at: at,
                unread_count: unread_delta,
            })
            .await;

        match created {
            Ok(Some(conv)) => {
                tracing::info!(conversation_id = %conv.id, patient_id = %patient_id, "conversation opened");
                Ok(conv)
            }
            // lost the race: another ingestion created it first
            Ok(None) | Err(StoreError::Conflict(_)) => {
                let conv = self
                    .store
                    .find_conversation(clinic_id, patient_id, Channel::Whatsapp)
                    .await?
                    .ok_or_else(|| StoreError::Conflict("conversation vanished after conflict".into()))?;
                self.store.touch_conversation(conv.id, at, unread_delta).await?;
                Ok(conv)
            }
            Err(e) => Err(e),
        }
    }

    async fn enrich(&self, saved: Message, attachment: &MediaAttachment, message_id: &str) -> Message {
        let Some(url) = self.media.offload(attachment, message_id).await else {
            tracing::warn!(message_id, row_id = %saved.id, "media unavailable, placeholder kept");
            return saved;
        };
        let Some(ready) = saved.content.with_url(url) else {
            return saved;
        };

        match best_effort(
            "media_url_patch",
            self.store.update_message_content(saved.id, &ready),
        )
        .await
        .flatten()
        {
            Some(updated) => {
                self.realtime.message_updated(&updated);
                updated
            }
            None => saved,
        }
    }
}
