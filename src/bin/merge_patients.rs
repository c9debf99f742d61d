//! Merges a duplicate lead into the surviving record.
//!
//! Usage: merge_patients <duplicate_phone> <surviving_phone>

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct PatientRef {
    id: Uuid,
    clinic_id: Uuid,
    name: String,
    avatar_url: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRef {
    id: Uuid,
    channel: String,
}

fn digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let (Some(dup_phone), Some(keep_phone)) = (args.next(), args.next()) else {
        bail!("Usage: merge_patients <duplicate_phone> <surviving_phone>");
    };
    let (dup_phone, keep_phone) = (digits(&dup_phone), digits(&keep_phone));
    if dup_phone == keep_phone {
        bail!("phones must differ");
    }

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;
    let mut tx = pool.begin().await?;

    let lookup = r#"
        SELECT id, clinic_id, name, avatar_url
        FROM patients
        WHERE phone = $1
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE
    "#;
    let dup: PatientRef = sqlx::query_as(lookup)
        .bind(&dup_phone)
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("no patient with phone {dup_phone}"))?;
    let keep: PatientRef = sqlx::query_as(lookup)
        .bind(&keep_phone)
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("no patient with phone {keep_phone}"))?;
    if dup.clinic_id != keep.clinic_id {
        bail!("patients belong to different clinics");
    }

    let conversations: Vec<ConversationRef> =
        sqlx::query_as("SELECT id, channel FROM conversations WHERE patient_id = $1")
            .bind(dup.id)
            .fetch_all(&mut *tx)
            .await?;

    let (mut moved, mut folded) = (0, 0);
    for conv in conversations {
        let target: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM conversations
            WHERE clinic_id = $1 AND patient_id = $2 AND channel = $3
            "#,
        )
        .bind(keep.clinic_id)
        .bind(keep.id)
        .bind(&conv.channel)
        .fetch_optional(&mut *tx)
        .await?;

        match target {
            // survivor already has a thread on this channel: fold messages into it
            Some(target) => {
                sqlx::query("UPDATE messages SET conversation_id = $1 WHERE conversation_id = $2")
                    .bind(target)
                    .bind(conv.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    UPDATE conversations t
                    SET unread_count = t.unread_count + s.unread_count,
                        last_message_at = GREATEST(t.last_message_at, s.last_message_at),
                        updated_at = now()
                    FROM conversations s
                    WHERE t.id = $1 AND s.id = $2
                    "#,
                )
                .bind(target)
                .bind(conv.id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM conversations WHERE id = $1")
                    .bind(conv.id)
                    .execute(&mut *tx)
                    .await?;
                folded += 1;
            }
            None => {
                sqlx::query("UPDATE conversations SET patient_id = $1, updated_at = now() WHERE id = $2")
                    .bind(keep.id)
                    .bind(conv.id)
                    .execute(&mut *tx)
                    .await?;
                moved += 1;
            }
        }
    }

    if keep.avatar_url.is_none() && dup.avatar_url.is_some() {
        sqlx::query("UPDATE patients SET avatar_url = $1, updated_at = now() WHERE id = $2")
            .bind(dup.avatar_url.as_deref())
            .bind(keep.id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM patients WHERE id = $1")
        .bind(dup.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    println!(
        "merged {} ({}) into {} ({}): {moved} conversation(s) moved, {folded} folded",
        dup.name, dup_phone, keep.name, keep_phone
    );
    Ok(())
}
