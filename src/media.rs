// src/media.rs

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};

use crate::blob::BlobStore;
use crate::envelope::MediaAttachment;
use crate::models::MediaKind;
use crate::transport::Transport;

const SUFFIX_LEN: usize = 7;

/// Mime type and file extension chosen for an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub mime: String,
    pub ext: String,
}

fn default_format(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Image => ("image/jpeg", "jpg"),
        MediaKind::Audio => ("audio/ogg", "ogg"),
        MediaKind::Video => ("video/mp4", "mp4"),
        MediaKind::Document => ("application/pdf", "pdf"),
    }
}

fn ext_for_mime(mime: &str) -> Option<&'static str> {
    Some(match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/aac" | "audio/x-m4a" => "m4a",
        "audio/amr" => "amr",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "video/quicktime" => "mov",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "text/plain" => "txt",
        "application/zip" => "zip",
        _ => return None,
    })
}

fn file_name_ext(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let ok = !stem.is_empty()
        && (1..=5).contains(&ext.len())
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then_some(ext)
}

/// Picks mime/extension from the declared mime type, falling back to per-kind
/// defaults. Documents prefer the extension of their original file name.
pub fn media_format(attachment: &MediaAttachment) -> MediaFormat {
    let (default_mime, default_ext) = default_format(attachment.kind);

    let declared = attachment
        .mimetype
        .as_deref()
        .and_then(|m| m.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty());

    let mime = declared.clone().unwrap_or_else(|| default_mime.to_string());

    let by_name = match attachment.kind {
        MediaKind::Document => attachment.file_name.as_deref().and_then(file_name_ext),
        _ => None,
    };
    let ext = by_name
        .or_else(|| declared.as_deref().and_then(ext_for_mime).map(str::to_string))
        .unwrap_or_else(|| default_ext.to_string());

    MediaFormat { mime, ext }
}

/// `{year}/{month}/{millis}_{random}.{ext}`, month not zero-padded.
pub fn storage_path(now: DateTime<Utc>, ext: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!(
        "{}/{}/{}_{}.{}",
        now.year(),
        now.month(),
        now.timestamp_millis(),
        suffix,
        ext
    )
}

#[derive(Clone)]
pub struct MediaOffloader {
    transport: Arc<dyn Transport>,
    blobs: Arc<dyn BlobStore>,
}

impl MediaOffloader {
    pub fn new(transport: Arc<dyn Transport>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { transport, blobs }
    }

    /// Downloads the attachment and stores it publicly. Never fails: `None` means the
    /// media could not be offloaded and the caller keeps its placeholder.
    pub async fn offload(&self, attachment: &MediaAttachment, message_id: &str) -> Option<String> {
        let bytes = self.download(attachment, message_id).await?;
        if bytes.is_empty() {
            tracing::warn!(message_id, kind = %attachment.kind, "media download returned no bytes");
            return None;
        }

        let format = media_format(attachment);
        let path = storage_path(Utc::now(), &format.ext);

        if let Err(e) = self.blobs.upload(&path, &bytes, &format.mime).await {
            tracing::error!(message_id, path = %path, error = %e, "media upload failed");
            return None;
        }

        let url = self.blobs.public_url(&path);
        tracing::info!(message_id, kind = %attachment.kind, url = %url, size = bytes.len(), "media offloaded");
        Some(url)
    }

    async fn download(&self, attachment: &MediaAttachment, message_id: &str) -> Option<Vec<u8>> {
        let primary = json!({ "message": attachment.message });
        let first = match self.transport.download_media(&primary).await {
            Ok(bytes) => return Some(bytes),
            Err(e) => e,
        };
        tracing::warn!(message_id, error = %first, "media download failed, retrying with rebuilt envelope");

        let node = attachment.node().cloned().unwrap_or(Value::Null);
        let mut rebuilt = serde_json::Map::new();
        rebuilt.insert(attachment.node_key().to_string(), node);
        let retry = json!({ "message": Value::Object(rebuilt) });

        match self.transport.download_media(&retry).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!(message_id, error = %e, "media download failed");
                None
            }
        }
    }
}
