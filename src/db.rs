// src/db.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::content::MessageContent;
use crate::models::{Channel, Conversation, Message, MessageType, Patient};
use crate::store::{
    NewConversation, NewMessage, NewPatient, PatientFilter, PatientPatch, Store, StoreError,
};

pub async fn connect_pg(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/* -------------------------
   DB Row Models
--------------------------*/

const PATIENT_COLUMNS: &str = "id, clinic_id, name, phone, channel, lead_status, avatar_url, \
     tags, notes, estimated_value, created_at";
const CONVERSATION_COLUMNS: &str = "id, clinic_id, patient_id, channel, last_message_at, \
     unread_count, last_message_content, last_message_type, is_active";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_type, sender_id, content, type, status, created_at";

#[derive(Debug, sqlx::FromRow)]
struct PatientRow {
    id: Uuid,
    clinic_id: Uuid,
    name: String,
    phone: String,
    channel: String,
    lead_status: String,
    avatar_url: Option<String>,
    tags: Option<Vec<String>>,
    notes: Option<String>,
    estimated_value: Option<f64>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    clinic_id: Uuid,
    patient_id: Uuid,
    channel: String,
    last_message_at: DateTime<Utc>,
    unread_count: i32,
    last_message_content: Option<String>,
    last_message_type: Option<String>,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_type: String,
    sender_id: Option<Uuid>,
    content: Option<String>,
    #[sqlx(rename = "type")]
    message_type: String,
    status: String,
    created_at: DateTime<Utc>,
}

fn parse<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Corrupt(e.to_string()))
}

impl TryFrom<PatientRow> for Patient {
    type Error = StoreError;

    fn try_from(r: PatientRow) -> Result<Self, Self::Error> {
        Ok(Patient {
            id: r.id,
            clinic_id: r.clinic_id,
            name: r.name,
            phone: r.phone,
            channel: parse(&r.channel)?,
            lead_status: parse(&r.lead_status)?,
            avatar_url: r.avatar_url,
            tags: r.tags.unwrap_or_default(),
            notes: r.notes,
            estimated_value: r.estimated_value,
            created_at: r.created_at,
        })
    }
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(r: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: r.id,
            clinic_id: r.clinic_id,
            patient_id: r.patient_id,
            channel: parse(&r.channel)?,
            last_message_at: r.last_message_at,
            unread_count: r.unread_count,
            last_message_content: r.last_message_content,
            last_message_type: r.last_message_type.as_deref().map(parse).transpose()?,
            is_active: r.is_active,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(r: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: r.id,
            conversation_id: r.conversation_id,
            sender_type: parse(&r.sender_type)?,
            sender_id: r.sender_id,
            content: MessageContent::decode(r.content.as_deref().unwrap_or_default()),
            message_type: parse(&r.message_type)?,
            status: parse(&r.status)?,
            created_at: r.created_at,
        })
    }
}

fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn map_write_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Database(e),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn first_clinic_id(&self) -> Result<Option<Uuid>, StoreError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM clinics
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db)
        .await?;
        Ok(id)
    }

    async fn find_patient_by_phones(
        &self,
        clinic_id: Uuid,
        channel: Channel,
        phones: &[String],
    ) -> Result<Option<Patient>, StoreError> {
        let row: Option<PatientRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PATIENT_COLUMNS}
            FROM patients
            WHERE clinic_id = $1 AND channel = $2 AND phone = ANY($3)
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(clinic_id)
        .bind(channel.as_str())
        .bind(phones)
        .fetch_optional(&self.db)
        .await?;
        row.map(Patient::try_from).transpose()
    }

    async fn find_patient_by_name(
        &self,
        clinic_id: Uuid,
        name: &str,
    ) -> Result<Option<Patient>, StoreError> {
        let row: Option<PatientRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PATIENT_COLUMNS}
            FROM patients
            WHERE clinic_id = $1 AND lower(name) = lower($2)
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(clinic_id)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;
        row.map(Patient::try_from).transpose()
    }

    async fn insert_patient(&self, new: NewPatient) -> Result<Patient, StoreError> {
        let row: PatientRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO patients
              (clinic_id, name, phone, channel, lead_status, avatar_url, tags, notes, estimated_value)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {PATIENT_COLUMNS}
            "#
        ))
        .bind(new.clinic_id)
        .bind(&new.name)
        .bind(&new.phone)
        .bind(new.channel.as_str())
        .bind(new.lead_status.as_str())
        .bind(new.avatar_url.as_deref())
        .bind(&new.tags)
        .bind(new.notes.as_deref())
        .bind(new.estimated_value)
        .fetch_one(&self.db)
        .await
        .map_err(map_write_err)?;
        row.try_into()
    }

    async fn get_patient(&self, clinic_id: Uuid, id: Uuid) -> Result<Option<Patient>, StoreError> {
        let row: Option<PatientRow> = sqlx::query_as(&format!(
            "SELECT {PATIENT_COLUMNS} FROM patients WHERE clinic_id = $1 AND id = $2"
        ))
        .bind(clinic_id)
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Patient::try_from).transpose()
    }

    async fn list_patients(
        &self,
        clinic_id: Uuid,
        filter: &PatientFilter,
    ) -> Result<Vec<Patient>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {PATIENT_COLUMNS} FROM patients WHERE clinic_id = "
        ));
        qb.push_bind(clinic_id);

        if let Some(status) = filter.lead_status {
            qb.push(" AND lead_status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(channel) = filter.channel {
            qb.push(" AND channel = ");
            qb.push_bind(channel.as_str());
        }
        if let Some(q) = filter.query.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let like = format!("%{q}%");
            qb.push(" AND (name ILIKE ");
            qb.push_bind(like.clone());
            qb.push(" OR phone ILIKE ");
            qb.push_bind(like);
            qb.push(") ");
        }

        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(filter.limit);

        let rows: Vec<PatientRow> = qb.build_query_as().fetch_all(&self.db).await?;
        convert(rows)
    }

    async fn update_patient(
        &self,
        clinic_id: Uuid,
        id: Uuid,
        patch: PatientPatch,
    ) -> Result<Option<Patient>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("UPDATE patients SET updated_at = now()");

        if let Some(name) = patch.name {
            qb.push(", name = ").push_bind(name);
        }
        if let Some(phone) = patch.phone {
            qb.push(", phone = ").push_bind(phone);
        }
        if let Some(channel) = patch.channel {
            qb.push(", channel = ").push_bind(channel.as_str());
        }
        if let Some(status) = patch.lead_status {
            qb.push(", lead_status = ").push_bind(status.as_str());
        }
        if let Some(avatar) = patch.avatar_url {
            qb.push(", avatar_url = ").push_bind(avatar);
        }
        if let Some(tags) = patch.tags {
            qb.push(", tags = ").push_bind(tags);
        }
        if let Some(notes) = patch.notes {
            qb.push(", notes = ").push_bind(notes);
        }
        if let Some(value) = patch.estimated_value {
            qb.push(", estimated_value = ").push_bind(value);
        }

        qb.push(" WHERE clinic_id = ").push_bind(clinic_id);
        qb.push(" AND id = ").push_bind(id);
        qb.push(format!(" RETURNING {PATIENT_COLUMNS}"));

        let row: Option<PatientRow> = qb
            .build_query_as()
            .fetch_optional(&self.db)
            .await
            .map_err(map_write_err)?;
        row.map(Patient::try_from).transpose()
    }

    async fn set_patient_avatar(&self, id: Uuid, url: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE patients
            SET avatar_url = $1, updated_at = now()
            WHERE id = $2
            "#,
        )
        .bind(url)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_avatar_by_phone(&self, phones: &[String], url: &str) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE patients
            SET avatar_url = $1, updated_at = now()
            WHERE phone = ANY($2)
            "#,
        )
        .bind(url)
        .bind(phones)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn delete_patient(&self, clinic_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
        // conversations and messages go with it (ON DELETE CASCADE)
        let res = sqlx::query("DELETE FROM patients WHERE clinic_id = $1 AND id = $2")
            .bind(clinic_id)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn find_conversation(
        &self,
        clinic_id: Uuid,
        patient_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE clinic_id = $1 AND patient_id = $2 AND channel = $3
            "#
        ))
        .bind(clinic_id)
        .bind(patient_id)
        .bind(channel.as_str())
        .fetch_optional(&self.db)
        .await?;
        row.map(Conversation::try_from).transpose()
    }

    async fn insert_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO conversations
              (clinic_id, patient_id, channel, last_message_at, unread_count, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            ON CONFLICT (clinic_id, patient_id, channel) DO NOTHING
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(new.clinic_id)
        .bind(new.patient_id)
        .bind(new.channel.as_str())
        .bind(new.last_message_at)
        .bind(new.unread_count)
        .fetch_optional(&self.db)
        .await
        .map_err(map_write_err)?;
        row.map(Conversation::try_from).transpose()
    }

    async fn touch_conversation(
        &self,
        id: Uuid,
        last_message_at: DateTime<Utc>,
        unread_delta: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_at = $1,
                unread_count = COALESCE(unread_count, 0) + $2,
                updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(last_message_at)
        .bind(unread_delta)
        .bind(id)
        .execute(&self.db)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    async fn set_conversation_preview(
        &self,
        id: Uuid,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_content = $1, last_message_type = $2
            WHERE id = $3
            "#,
        )
        .bind(content)
        .bind(message_type.as_str())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_conversation_read(&self, id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE conversations
            SET unread_count = 0, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Conversation::try_from).transpose()
    }

    async fn list_conversations(&self, clinic_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE clinic_id = $1
            ORDER BY last_message_at DESC
            "#
        ))
        .bind(clinic_id)
        .fetch_all(&self.db)
        .await?;
        convert(rows)
    }

    async fn delete_conversation(&self, clinic_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM conversations WHERE clinic_id = $1 AND id = $2")
            .bind(clinic_id)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let row: MessageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO messages
              (conversation_id, sender_type, sender_id, content, type, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(new.conversation_id)
        .bind(new.sender_type.as_str())
        .bind(new.sender_id)
        .bind(new.content.encode())
        .bind(MessageType::Text.as_str())
        .bind(new.status.as_str())
        .bind(new.created_at)
        .fetch_one(&self.db)
        .await
        .map_err(map_write_err)?;
        row.try_into()
    }

    async fn update_message_content(
        &self,
        id: Uuid,
        content: &MessageContent,
    ) -> Result<Option<Message>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "UPDATE messages SET content = $1 WHERE id = $2 RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(content.encode())
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(map_write_err)?;
        row.map(Message::try_from).transpose()
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        convert(rows)
    }
}
