// src/blob.rs

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid blob path: {0}")]
    InvalidPath(String),
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Public object storage for media. Paths are relative (`2026/10/<file>`), never
/// overwritten.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), BlobError>;
    fn public_url(&self, path: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    root: PathBuf,
    public_base: String,
}

impl DiskBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base: &str) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BlobError::AlreadyExists(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        discard_on_error(&target, written).await?;

        tracing::debug!(path, content_type, size = bytes.len(), "blob stored");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base, path)
    }
}

/// Removes a partially written object so it never becomes publicly readable.
async fn discard_on_error(target: &Path, written: std::io::Result<()>) -> Result<(), BlobError> {
    if let Err(e) = written {
        if let Err(rm) = tokio::fs::remove_file(target).await {
            tracing::warn!(path = %target.display(), error = %rm, "could not remove partial blob");
        }
        return Err(e.into());
    }
    Ok(())
}
