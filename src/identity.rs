//! Maps transport identities onto patient records.
//!
//! The transport may key a chat by the real phone number (`<digits>@s.whatsapp.net`)
//! or by an anonymized id (`<digits>@lid`). The resolver picks the best candidate,
//! translates anonymized ids through the [`ContactBook`] when possible, and then finds
//! or creates the patient.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::envelope::MessageKey;
use crate::models::{Channel, Patient};
use crate::phone::{PhoneNormalizer, digits_only};
use crate::store::{NewPatient, Store, StoreError, best_effort};
use crate::transport::{Contact, LID_SUFFIX, Transport, USER_JID_SUFFIX, user_jid};

/// Real phone numbers never exceed this many digits (E.164 allows 15, but the
/// transport's anonymized ids start above it in practice).
const MAX_PHONE_DIGITS: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no sender identity in message key")]
    NoIdentity,
    #[error("patient lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error("could not create patient for {phone}: {source}")]
    Create { phone: String, source: StoreError },
}

/// Local address-book cache: anonymized id digits → phone digits.
#[derive(Debug, Default)]
pub struct ContactBook {
    lids: DashMap<String, String>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, contacts: &[Contact]) {
        for contact in contacts {
            let Some(lid) = contact.lid.as_deref() else {
                continue;
            };
            if !contact.id.ends_with(USER_JID_SUFFIX) {
                continue;
            }
            let (lid, phone) = (jid_digits(lid), jid_digits(&contact.id));
            if !lid.is_empty() && !phone.is_empty() {
                self.lids.insert(lid, phone);
            }
        }
    }

    pub fn phone_for_lid(&self, lid_digits: &str) -> Option<String> {
        self.lids.get(lid_digits).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.lids.len()
    }
}

/// Digits of a jid's user part, without server or device suffix
/// (`5511987654321:12@s.whatsapp.net` → `5511987654321`).
pub fn jid_digits(jid: &str) -> String {
    let user = jid.split('@').next().unwrap_or_default();
    let user = user.split(':').next().unwrap_or_default();
    digits_only(user)
}

/// Candidate identifiers of the other party, in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportIdentity {
    pub primary: Option<String>,
    pub primary_alt: Option<String>,
    pub participant: Option<String>,
    pub participant_alt: Option<String>,
}

impl From<&MessageKey> for TransportIdentity {
    fn from(key: &MessageKey) -> Self {
        Self {
            primary: key.remote_jid.clone(),
            primary_alt: key.remote_jid_alt.clone(),
            participant: key.participant.clone(),
            participant_alt: key.participant_alt.clone(),
        }
    }
}

impl TransportIdentity {
    fn candidates(&self) -> impl Iterator<Item = &str> {
        [
            &self.primary,
            &self.primary_alt,
            &self.participant,
            &self.participant_alt,
        ]
        .into_iter()
        .filter_map(|c| c.as_deref())
        .filter(|c| !c.is_empty())
    }

    /// First phone-keyed candidate, else the primary id.
    pub fn best_jid(&self) -> Option<&str> {
        self.candidates()
            .find(|c| c.ends_with(USER_JID_SUFFIX))
            .or_else(|| self.primary.as_deref().filter(|p| !p.is_empty()))
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    phones: PhoneNormalizer,
    contacts: Arc<ContactBook>,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        phones: PhoneNormalizer,
        contacts: Arc<ContactBook>,
    ) -> Self {
        Self {
            store,
            transport,
            phones,
            contacts,
        }
    }

    /// Raw sender number: digits of the best candidate, with anonymized ids
    /// translated through the contact book when the mapping is known.
    pub fn sender_number(&self, identity: &TransportIdentity) -> Option<String> {
        let jid = identity.best_jid()?;
        let digits = jid_digits(jid);
        if digits.is_empty() {
            return None;
        }

        if digits.len() > MAX_PHONE_DIGITS || jid.ends_with(LID_SUFFIX) {
            match self.contacts.phone_for_lid(&digits) {
                Some(phone) => {
                    tracing::debug!(lid = %digits, phone = %phone, "anonymized id mapped via contacts");
                    return Some(phone);
                }
                None => {
                    tracing::warn!(lid = %digits, "anonymized id not in contact book, using it as-is");
                }
            }
        }
        Some(digits)
    }

    pub async fn resolve(
        &self,
        clinic_id: Uuid,
        identity: &TransportIdentity,
        display_name: Option<&str>,
        outbound: bool,
    ) -> Result<Patient, ResolveError> {
        let raw = self.sender_number(identity).ok_or(ResolveError::NoIdentity)?;
        // profile photo lookups go to the chat jid, not to the digits we derived
        let photo_jid = identity
            .best_jid()
            .filter(|j| j.ends_with(USER_JID_SUFFIX))
            .map(str::to_string)
            .unwrap_or_else(|| user_jid(&raw));

        if outbound {
            self.resolve_recipient(clinic_id, &raw).await
        } else {
            self.resolve_sender(clinic_id, &raw, display_name, &photo_jid)
                .await
        }
    }

    async fn resolve_sender(
        &self,
        clinic_id: Uuid,
        raw: &str,
        display_name: Option<&str>,
        photo_jid: &str,
    ) -> Result<Patient, ResolveError> {
        let phone = self.phones.normalize(raw);
        let variants: Vec<String> = self.phones.variants(raw).into_iter().collect();

        let mut found = self
            .store
            .find_patient_by_phones(clinic_id, Channel::Whatsapp, &variants)
            .await?;

        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty() && digits_only(n) != raw && *n != phone);

        if found.is_none() {
            if let Some(name) = name {
                found = self.store.find_patient_by_name(clinic_id, name).await?;
                if let Some(p) = &found {
                    tracing::warn!(
                        patient_id = %p.id,
                        phone = %phone,
                        name,
                        "low-confidence association: matched patient by display name"
                    );
                }
            }
        }

        match found {
            Some(mut patient) => {
                if patient.avatar_url.is_none() {
                    if let Some(url) = self.fetch_avatar(photo_jid).await {
                        best_effort(
                            "avatar_backfill",
                            self.store.set_patient_avatar(patient.id, &url),
                        )
                        .await;
                        patient.avatar_url = Some(url);
                    }
                }
                Ok(patient)
            }
            None => {
                let mut new = NewPatient::whatsapp_lead(
                    clinic_id,
                    name.map(str::to_string).unwrap_or_else(|| phone.clone()),
                    phone.clone(),
                );
                new.avatar_url = self.fetch_avatar(photo_jid).await;
                self.create_or_requery(new, &variants).await
            }
        }
    }

    async fn resolve_recipient(&self, clinic_id: Uuid, raw: &str) -> Result<Patient, ResolveError> {
        let phone = self.phones.normalize(raw);

        let exact = vec![phone.clone()];
        if let Some(p) = self
            .store
            .find_patient_by_phones(clinic_id, Channel::Whatsapp, &exact)
            .await? {
            return Ok(p);
        }

        if let Some(national) = self.phones.national(&phone) {
            if let Some(p) = self
                .store
                .find_patient_by_phones(clinic_id, Channel::Whatsapp, &[national])
                .await?
            {
                return Ok(p);
            }
        }

        let new = NewPatient::whatsapp_lead(clinic_id, phone.clone(), phone);
        self.create_or_requery(new, &exact).await
    }

    async fn create_or_requery(
        &self,
        new: NewPatient,
        lookup: &[String],
    ) -> Result<Patient, ResolveError> {
        let clinic_id = new.clinic_id;
        let channel = new.channel;
        let phone = new.phone.clone();

        match self.store.insert_patient(new).await {
            Ok(patient) => {
                tracing::info!(patient_id = %patient.id, phone = %patient.phone, "new lead created");
                Ok(patient)
            }
            Err(source) => {
                tracing::warn!(phone = %phone, error = %source, "patient insert failed, re-querying");
                match self.store.find_patient_by_phones(clinic_id, channel, lookup).await {
                    Ok(Some(patient)) => Ok(patient),
                    Ok(None) | Err(_) => Err(ResolveError::Create { phone, source }),
                }
            }
        }
    }

    async fn fetch_avatar(&self, jid: &str) -> Option<String> {
        best_effort("avatar_fetch", self.transport.profile_picture_url(jid))
            .await
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, MemoryStore};
    use std::time::Duration;

    fn resolver(store: &Arc<MemoryStore>, transport: &Arc<FakeTransport>) -> IdentityResolver {
        IdentityResolver::new(
            store.clone(),
            transport.clone(),
            PhoneNormalizer::default(),
            Arc::new(ContactBook::new()),
        )
    }

    fn phone_identity(jid: &str) -> TransportIdentity {
        TransportIdentity {
            primary: Some(jid.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn prefers_phone_keyed_candidate() {
        let id = TransportIdentity {
            primary: Some("201499128893603@lid".into()),
            primary_alt: Some("5511987654321@s.whatsapp.net".into()),
            ..Default::default()
        };
        assert_eq!(id.best_jid(), Some("5511987654321@s.whatsapp.net"));

        let lid_only = phone_identity("201499128893603@lid");
        assert_eq!(lid_only.best_jid(), Some("201499128893603@lid"));
    }

    #[test]
    fn strips_device_suffix() {
        assert_eq!(jid_digits("5511987654321:12@s.whatsapp.net"), "5511987654321");
        assert_eq!(jid_digits("201499128893603@lid"), "201499128893603");
    }

    #[test]
    fn lid_is_translated_through_contact_book() {
        let store = MemoryStore::new();
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);
        r.contacts.remember(&[Contact {
            id: "5511987654321@s.whatsapp.net".into(),
            lid: Some("201499128893603@lid".into()),
        }]);
        assert_eq!(r.contacts.len(), 1);

        let id = phone_identity("201499128893603@lid");
        assert_eq!(r.sender_number(&id).as_deref(), Some("5511987654321"));

        let unknown = phone_identity("999999999999999@lid");
        assert_eq!(r.sender_number(&unknown).as_deref(), Some("999999999999999"));
    }

    #[tokio::test]
    async fn inbound_ignores_same_number_on_other_channels() {
        let store = MemoryStore::new();
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);

        let mut insta = NewPatient::whatsapp_lead(
            store.clinic_id(),
            "Maria IG".into(),
            "551187654321".into(),
        );
        insta.channel = Channel::Instagram;
        let insta = store.insert_patient(insta).await.unwrap();

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5511987654321@s.whatsapp.net"),
                None,
                false,
            )
            .await
            .unwrap();

        assert_ne!(p.id, insta.id);
        assert_eq!(p.channel, Channel::Whatsapp);
        assert_eq!(store.patients().len(), 2);
    }

    #[tokio::test]
    async fn inbound_creates_new_lead_with_normalized_phone_and_avatar() {
        let store = MemoryStore::new();
        let transport = FakeTransport::new();
        transport.set_avatar(Some("http://pps.example/a.jpg"));
        let r = resolver(&store, &transport);

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5511987654321@s.whatsapp.net"),
                Some("Maria"),
                false,
            )
            .await
            .unwrap();

        assert_eq!(p.phone, "551187654321");
        assert_eq!(p.name, "Maria");
        assert_eq!(p.lead_status, crate::models::LeadStatus::New);
        assert_eq!(p.avatar_url.as_deref(), Some("http://pps.example/a.jpg"));
    }

    #[tokio::test]
    async fn same_identity_different_names_resolves_to_one_patient() {
        let store = MemoryStore::new();
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);
        let id = phone_identity("5511987654321@s.whatsapp.net");

        let a = r.resolve(store.clinic_id(), &id, Some("Maria"), false).await.unwrap();
        let b = r
            .resolve(store.clinic_id(), &id, Some("Maria Silva"), false)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.patients().len(), 1);
    }

    #[tokio::test]
    async fn legacy_long_form_record_is_matched_by_variants() {
        let store = MemoryStore::new();
        let existing = store.seed_patient("Joao", "5511987654321");
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("551187654321@s.whatsapp.net"),
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(p.id, existing.id);
    }

    #[tokio::test]
    async fn falls_back_to_name_match_for_unknown_number() {
        let store = MemoryStore::new();
        let existing = store.seed_patient("Ana Paula", "4400000000");
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("201499128893603@lid"),
                Some("ana paula"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(p.id, existing.id);
    }

    #[tokio::test]
    async fn backfills_missing_avatar_best_effort() {
        let store = MemoryStore::new();
        let existing = store.seed_patient("Joao", "551187654321");
        let transport = FakeTransport::new();
        transport.set_avatar(Some("http://pps.example/j.jpg"));
        let r = resolver(&store, &transport);

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5511987654321@s.whatsapp.net"),
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(p.id, existing.id);
        assert_eq!(
            store.patient(existing.id).unwrap().avatar_url.as_deref(),
            Some("http://pps.example/j.jpg")
        );
    }

    #[tokio::test]
    async fn avatar_failure_is_not_fatal() {
        let store = MemoryStore::new();
        let transport = FakeTransport::new();
        transport.fail_avatar(true);
        let r = resolver(&store, &transport);

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5511912345678@s.whatsapp.net"),
                None,
                false,
            )
            .await
            .unwrap();
        assert!(p.avatar_url.is_none());
    }

    #[tokio::test]
    async fn outbound_matches_national_form_then_creates_minimal_record() {
        let store = MemoryStore::new();
        let legacy = store.seed_patient("Carla", "1187654321");
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);

        let p = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5511987654321@s.whatsapp.net"),
                Some("Clinica Sorriso"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(p.id, legacy.id);

        let fresh = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5521988887777@s.whatsapp.net"),
                Some("Clinica Sorriso"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(fresh.phone, "552188887777");
        assert_eq!(fresh.name, "552188887777");
    }

    #[tokio::test]
    async fn concurrent_new_identity_creates_one_patient() {
        let store = MemoryStore::new();
        store.set_insert_delay(Duration::from_millis(50));
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);
        let id = phone_identity("5511987654321@s.whatsapp.net");

        let (a, b) = tokio::join!(
            r.resolve(store.clinic_id(), &id, Some("Maria"), false),
            r.resolve(store.clinic_id(), &id, Some("Maria"), false),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.patients().len(), 1);
    }

    #[tokio::test]
    async fn create_failure_without_requery_hit_is_an_error() {
        let store = MemoryStore::new();
        store.fail_patient_insert(true);
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);

        let err = r
            .resolve(
                store.clinic_id(),
                &phone_identity("5511987654321@s.whatsapp.net"),
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Create { .. }));
        assert!(store.patients().is_empty());
    }

    #[tokio::test]
    async fn empty_identity_is_rejected() {
        let store = MemoryStore::new();
        let transport = FakeTransport::new();
        let r = resolver(&store, &transport);
        let err = r
            .resolve(store.clinic_id(), &TransportIdentity::default(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoIdentity));
    }
}
