//! In-memory fakes of the store, transport and blob collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::blob::{BlobError, BlobStore};
use crate::content::MessageContent;
use crate::models::{Channel, Conversation, Message, MessageType, Patient};
use crate::store::{
    NewConversation, NewMessage, NewPatient, PatientFilter, PatientPatch, Store, StoreError,
};
use crate::transport::{ConnectionState, Transport, TransportError, TransportEvent};

/* -------------------------
   Store
--------------------------*/

#[derive(Default)]
struct Tables {
    patients: Vec<Patient>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
}

pub struct MemoryStore {
    clinic_id: Uuid,
    tables: Mutex<Tables>,
    insert_delay: Mutex<Duration>,
    fail_patient_insert: AtomicBool,
    fail_message_insert: AtomicBool,
    fail_preview: AtomicBool,
    clock: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clinic_id: Uuid::new_v4(),
            tables: Mutex::new(Tables::default()),
            insert_delay: Mutex::new(Duration::ZERO),
            fail_patient_insert: AtomicBool::new(false),
            fail_message_insert: AtomicBool::new(false),
            fail_preview: AtomicBool::new(false),
            clock: AtomicUsize::new(0),
        })
    }

    pub fn clinic_id(&self) -> Uuid {
        self.clinic_id
    }

    /// Delay applied inside patient and conversation inserts, before the
    /// uniqueness check, to widen race windows.
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = delay;
    }

    pub fn fail_patient_insert(&self, on: bool) {
        self.fail_patient_insert.store(on, Ordering::SeqCst);
    }

    pub fn fail_message_insert(&self, on: bool) {
        self.fail_message_insert.store(on, Ordering::SeqCst);
    }

    pub fn fail_preview(&self, on: bool) {
        self.fail_preview.store(on, Ordering::SeqCst);
    }

    pub fn patients(&self) -> Vec<Patient> {
        self.tables.lock().unwrap().patients.clone()
    }

    pub fn patient(&self, id: Uuid) -> Option<Patient> {
        self.patients().into_iter().find(|p| p.id == id)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.tables.lock().unwrap().conversations.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.tables.lock().unwrap().messages.clone()
    }

    pub fn seed_patient(&self, name: &str, phone: &str) -> Patient {
        let patient = self.build_patient(NewPatient::whatsapp_lead(
            self.clinic_id,
            name.to_string(),
            phone.to_string(),
        ));
        self.tables.lock().unwrap().patients.push(patient.clone());
        patient
    }

    pub fn seed_conversation(&self, patient_id: Uuid, unread_count: i32) -> Conversation {
        let conv = Conversation {
            id: Uuid::new_v4(),
            clinic_id: self.clinic_id,
            patient_id,
            channel: Channel::Whatsapp,
            last_message_at: Utc::now(),
            unread_count,
            last_message_content: None,
            last_message_type: None,
            is_active: true,
        };
        self.tables.lock().unwrap().conversations.push(conv.clone());
        conv
    }

    // strictly increasing creation times so "newest first" is deterministic
    fn tick(&self) -> DateTime<Utc> {
        let n = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        DateTime::<Utc>::from_timestamp(1_700_000_000 + n, 0).unwrap_or_default()
    }

    fn build_patient(&self, new: NewPatient) -> Patient {
        Patient {
            id: Uuid::new_v4(),
            clinic_id: new.clinic_id,
            name: new.name,
            phone: new.phone,
            channel: new.channel,
            lead_status: new.lead_status,
            avatar_url: new.avatar_url,
            tags: new.tags,
            notes: new.notes,
            estimated_value: new.estimated_value,
            created_at: self.tick(),
        }
    }

    async fn delay(&self) {
        let d = *self.insert_delay.lock().unwrap();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn first_clinic_id(&self) -> Result<Option<Uuid>, StoreError> {
        Ok(Some(self.clinic_id))
    }

    async fn find_patient_by_phones(
        &self,
        clinic_id: Uuid,
        channel: Channel,
        phones: &[String],
    ) -> Result<Option<Patient>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.patients
            .iter()
            .filter(|p| {
                p.clinic_id == clinic_id && p.channel == channel && phones.contains(&p.phone)
            })
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn find_patient_by_name(
        &self,
        clinic_id: Uuid,
        name: &str,
    ) -> Result<Option<Patient>, StoreError> {
        let t = self.tables.lock().unwrap();
        let wanted = name.to_lowercase();
        Ok(t.patients
            .iter()
            .filter(|p| p.clinic_id == clinic_id && p.name.to_lowercase() == wanted)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn insert_patient(&self, new: NewPatient) -> Result<Patient, StoreError> {
        self.delay().await;
        if self.fail_patient_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("patient insert disabled".into()));
        }
        let patient = self.build_patient(new);
        let mut t = self.tables.lock().unwrap();
        let dup = t.patients.iter().any(|p| {
            p.clinic_id == patient.clinic_id
                && p.channel == patient.channel
                && p.phone == patient.phone
        });
        if dup {
            return Err(StoreError::Conflict(
                "patients_clinic_channel_phone_uq".into(),
            ));
        }
        t.patients.push(patient.clone());
        Ok(patient)
    }

    async fn get_patient(&self, clinic_id: Uuid, id: Uuid) -> Result<Option<Patient>, StoreError> {
        Ok(self
            .patient(id)
            .filter(|p| p.clinic_id == clinic_id))
    }

    async fn list_patients(
        &self,
        clinic_id: Uuid,
        filter: &PatientFilter,
    ) -> Result<Vec<Patient>, StoreError> {
        let q = filter.query.as_deref().map(str::to_lowercase);
        let mut out: Vec<Patient> = self
            .patients()
            .into_iter()
            .filter(|p| p.clinic_id == clinic_id)
            .filter(|p| filter.lead_status.is_none_or(|s| p.lead_status == s))
            .filter(|p| filter.channel.is_none_or(|c| p.channel == c))
            .filter(|p| {
                q.as_deref().is_none_or(|q| {
                    p.name.to_lowercase().contains(q) || p.phone.contains(q)
                })
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(filter.limit.max(0) as usize);
        Ok(out)
    }

    async fn update_patient(
        &self,
        clinic_id: Uuid,
        id: Uuid,
        patch: PatientPatch,
    ) -> Result<Option<Patient>, StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(phone) = &patch.phone {
            let taken = t
                .patients
                .iter()
                .any(|p| p.id != id && p.clinic_id == clinic_id && &p.phone == phone);
            if taken {
                return Err(StoreError::Conflict("patients_clinic_channel_phone_uq".into()));
            }
        }
        let Some(p) = t
            .patients
            .iter_mut()
            .find(|p| p.id == id && p.clinic_id == clinic_id)
        else {
            return Ok(None);
        };
        if let Some(v) = patch.name {
            p.name = v;
        }
        if let Some(v) = patch.phone {
            p.phone = v;
        }
        if let Some(v) = patch.channel {
            p.channel = v;
        }
        if let Some(v) = patch.lead_status {
            p.lead_status = v;
        }
        if let Some(v) = patch.avatar_url {
            p.avatar_url = v;
        }
        if let Some(v) = patch.tags {
            p.tags = v;
        }
        if let Some(v) = patch.notes {
            p.notes = v;
        }
        if let Some(v) = patch.estimated_value {
            p.estimated_value = v;
        }
        Ok(Some(p.clone()))
    }

    async fn set_patient_avatar(&self, id: Uuid, url: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(p) = t.patients.iter_mut().find(|p| p.id == id) {
            p.avatar_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn set_avatar_by_phone(&self, phones: &[String], url: &str) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().unwrap();
        let mut n = 0;
        for p in t.patients.iter_mut().filter(|p| phones.contains(&p.phone)) {
            p.avatar_url = Some(url.to_string());
            n += 1;
        }
        Ok(n)
    }

    async fn delete_patient(&self, clinic_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().unwrap();
        let before = t.patients.len();
        t.patients.retain(|p| !(p.id == id && p.clinic_id == clinic_id));
        if t.patients.len() == before {
            return Ok(false);
        }
        let gone: Vec<Uuid> = t
            .conversations
            .iter()
            .filter(|c| c.patient_id == id)
            .map(|c| c.id)
            .collect();
        t.conversations.retain(|c| c.patient_id != id);
        t.messages.retain(|m| !gone.contains(&m.conversation_id));
        Ok(true)
    }

    async fn find_conversation(
        &self,
        clinic_id: Uuid,
        patient_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Conversation>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.conversations
            .iter()
            .find(|c| c.clinic_id == clinic_id && c.patient_id == patient_id && c.channel == channel)
            .cloned())
    }

    async fn insert_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Option<Conversation>, StoreError> {
        self.delay().await;
        let mut t = self.tables.lock().unwrap();
        let exists = t.conversations.iter().any(|c| {
            c.clinic_id == new.clinic_id && c.patient_id == new.patient_id && c.channel == new.channel
        });
        if exists {
            return Ok(None);
        }
        let conv = Conversation {
            id: Uuid::new_v4(),
            clinic_id: new.clinic_id,
            patient_id: new.patient_id,
            channel: new.channel,
            last_message_at: new.last_message_at,
            unread_count: new.unread_count,
            last_message_content: None,
            last_message_type: None,
            is_active: true,
        };
        t.conversations.push(conv.clone());
        Ok(Some(conv))
    }

    async fn touch_conversation(
        &self,
        id: Uuid,
        last_message_at: DateTime<Utc>,
        unread_delta: i32,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(c) = t.conversations.iter_mut().find(|c| c.id == id) {
            c.last_message_at = last_message_at;
            c.unread_count += unread_delta;
        }
        Ok(())
    }

    async fn set_conversation_preview(
        &self,
        id: Uuid,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), StoreError> {
        if self.fail_preview.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "column \"last_message_content\" does not exist".into(),
            ));
        }
        let mut t = self.tables.lock().unwrap();
        if let Some(c) = t.conversations.iter_mut().find(|c| c.id == id) {
            c.last_message_content = Some(content.to_string());
            c.last_message_type = Some(message_type);
        }
        Ok(())
    }

    async fn mark_conversation_read(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().unwrap();
        match t.conversations.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.unread_count = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations().into_iter().find(|c| c.id == id))
    }

    async fn list_conversations(&self, clinic_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        let mut out: Vec<Conversation> = self
            .conversations()
            .into_iter()
            .filter(|c| c.clinic_id == clinic_id)
            .collect();
        out.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(out)
    }

    async fn delete_conversation(&self, clinic_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().unwrap();
        let before = t.conversations.len();
        t.conversations
            .retain(|c| !(c.id == id && c.clinic_id == clinic_id));
        let deleted = t.conversations.len() != before;
        if deleted {
            t.messages.retain(|m| m.conversation_id != id);
        }
        Ok(deleted)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        if self.fail_message_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("message insert disabled".into()));
        }
        let msg = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_type: new.sender_type,
            sender_id: new.sender_id,
            content: new.content,
            message_type: MessageType::Text,
            status: new.status,
            created_at: new.created_at,
        };
        self.tables.lock().unwrap().messages.push(msg.clone());
        Ok(msg)
    }

    async fn update_message_content(
        &self,
        id: Uuid,
        content: &MessageContent,
    ) -> Result<Option<Message>, StoreError> {
        let mut t = self.tables.lock().unwrap();
        Ok(t.messages.iter_mut().find(|m| m.id == id).map(|m| {
            m.content = content.clone();
            m.clone()
        }))
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let mut out: Vec<Message> = self
            .messages()
            .into_iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }
}

/* -------------------------
   Transport
--------------------------*/

#[derive(Default)]
pub struct FakeTransport {
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<(String, String)>>,
    avatar: Mutex<Option<String>>,
    avatar_fails: AtomicBool,
    media: Mutex<Option<Vec<u8>>>,
    failing_downloads: AtomicUsize,
    download_calls: Mutex<Vec<Value>>,
    download_gate: Mutex<Option<Arc<Notify>>>,
    connect_fails: AtomicBool,
    connects: AtomicUsize,
    logouts: AtomicUsize,
    ends: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_avatar(&self, url: Option<&str>) {
        *self.avatar.lock().unwrap() = url.map(str::to_string);
    }

    pub fn fail_avatar(&self, on: bool) {
        self.avatar_fails.store(on, Ordering::SeqCst);
    }

    /// `None` makes every download fail.
    pub fn set_media(&self, bytes: Option<Vec<u8>>) {
        *self.media.lock().unwrap() = bytes;
    }

    pub fn fail_next_downloads(&self, n: usize) {
        self.failing_downloads.store(n, Ordering::SeqCst);
    }

    /// Downloads block until the returned handle is notified.
    pub fn gate_downloads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.download_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_connect(&self, on: bool) {
        self.connect_fails.store(on, Ordering::SeqCst);
    }

    pub fn download_calls(&self) -> Vec<Value> {
        self.download_calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    /// Pushes an event into the sink of the latest `connect` call.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails.load(Ordering::SeqCst) {
            // a bridge that dies mid-handshake also reports the close on its event stream
            let _ = events
                .send(TransportEvent::Connection {
                    state: Some(ConnectionState::Close),
                    qr: None,
                    status_code: None,
                })
                .await;
            return Err(TransportError::Request("bridge failed to start".into()));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }

    async fn profile_picture_url(&self, _jid: &str) -> Result<Option<String>, TransportError> {
        if self.avatar_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Request("item-not-found".into()));
        }
        Ok(self.avatar.lock().unwrap().clone())
    }

    async fn download_media(&self, envelope: &Value) -> Result<Vec<u8>, TransportError> {
        self.download_calls.lock().unwrap().push(envelope.clone());
        let gate = self.download_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failing = self.failing_downloads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_downloads.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Request("media key missing".into()));
        }
        self.media
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::Request("connection reset".into()))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap() = None;
    }
}

/* -------------------------
   Blobs
--------------------------*/

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail: AtomicBool,
}

impl MemoryBlobStore {
    pub const BASE: &'static str = "http://blobs.test/media";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_uploads(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }

    pub fn objects(&self) -> HashMap<String, (Vec<u8>, String)> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), BlobError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BlobError::Io(std::io::Error::other("bucket unavailable")));
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(path) {
            return Err(BlobError::AlreadyExists(path.to_string()));
        }
        objects.insert(path.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", Self::BASE, path)
    }
}

/* -------------------------
   Application
--------------------------*/

pub struct TestApp {
    pub state: crate::models::AppState,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<FakeTransport>,
    pub session: tokio::sync::watch::Receiver<crate::supervisor::SessionState>,
}

/// Full application state over fakes, with a live supervisor actor.
pub fn test_app() -> TestApp {
    use crate::identity::{ContactBook, IdentityResolver};
    use crate::ingest::MessageIngester;
    use crate::media::MediaOffloader;
    use crate::phone::PhoneNormalizer;
    use crate::realtime::RealtimeBroadcaster;
    use crate::supervisor::{ConnectionSupervisor, SupervisorConfig, session_channel};

    let store = MemoryStore::new();
    let transport = FakeTransport::new();
    let contacts = Arc::new(ContactBook::new());
    let (session_tx, session_rx) = session_channel();
    let realtime = RealtimeBroadcaster::new(session_rx.clone());
    let phones = PhoneNormalizer::default();

    let resolver = IdentityResolver::new(
        store.clone(),
        transport.clone(),
        phones.clone(),
        contacts.clone(),
    );
    let media = MediaOffloader::new(transport.clone(), MemoryBlobStore::new());
    let ingester = MessageIngester::new(store.clone(), resolver, media, realtime.clone(), None);
    let supervisor = ConnectionSupervisor::spawn(
        transport.clone(),
        ingester,
        contacts,
        realtime.clone(),
        session_tx,
        SupervisorConfig {
            auth_dir: std::env::temp_dir().join(format!("wa-auth-{}", Uuid::new_v4())),
            reconnect_delay: Duration::from_millis(20),
            logout_restart_delay: Duration::from_millis(20),
        },
    );

    let state = crate::models::AppState {
        store: store.clone(),
        transport: transport.clone(),
        supervisor,
        realtime,
        phones,
        default_clinic_id: None,
    };
    TestApp {
        state,
        store,
        transport,
        session: session_rx,
    }
}

impl TestApp {
    /// Drives the supervisor to `connected` through the fake transport.
    pub async fn connect(&mut self) {
        use crate::supervisor::ConnectionStatus;
        use crate::transport::ConnectionState;

        self.state.supervisor.init().await.unwrap();
        self.transport
            .emit(TransportEvent::Connection {
                state: Some(ConnectionState::Open),
                qr: None,
                status_code: None,
            })
            .await;
        tokio::time::timeout(
            Duration::from_secs(2),
            self.session.wait_for(|s| s.status == ConnectionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
