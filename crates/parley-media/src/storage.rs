use parley_models::message::{MediaRef, MessageType};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("file too large: {size} bytes exceeds {limit}")]
    TooLarge { size: u64, limit: u64 },
}

#[allow(async_fn_in_trait)]
pub trait Storage: Send + Sync {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Blobs as plain files below one directory, keyed by relative path.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }
}

impl Storage for LocalStorage {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub base_path: PathBuf,
    pub max_file_size: u64,
    /// URL prefix the stored files are served under.
    pub public_prefix: String,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub url: String,
}

impl StoredMedia {
    pub fn media_ref(&self) -> MediaRef {
        MediaRef {
            url: self.url.clone(),
            filename: Some(self.filename.clone()),
        }
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_mime(&self.content_type)
    }
}

/// Upload sink for message attachments.
#[derive(Debug, Clone)]
pub struct MediaStore {
    config: MediaConfig,
    storage: LocalStorage,
}

impl MediaStore {
    pub fn new(config: MediaConfig) -> Self {
        let storage = LocalStorage::new(config.base_path.clone());
        Self { config, storage }
    }

    pub fn base_path(&self) -> &Path {
        self.storage.base_path()
    }

    /// Store an upload under a fresh UUID name. The original filename only
    /// contributes its extension and is echoed back for display.
    pub async fn store_upload(
        &self,
        filename: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<StoredMedia, StorageError> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(StorageError::TooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }

        let content_type = content_type
            .filter(|ct| !ct.is_empty() && *ct != "application/octet-stream")
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(filename)
                    .first_or_octet_stream()
                    .to_string()
            });

        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("");
        let id = Uuid::new_v4().to_string();
        let key = if ext.is_empty() {
            id
        } else {
            format!("{}.{}", id, ext.to_ascii_lowercase())
        };

        self.storage.store(&key, data).await?;
        tracing::debug!(key = %key, size, content_type = %content_type, "media: stored upload");

        let url = format!(
            "{}/{}",
            self.config.public_prefix.trim_end_matches('/'),
            urlencoding::encode(&key)
        );
        Ok(StoredMedia {
            key,
            filename: filename.to_string(),
            content_type,
            url,
        })
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.storage.delete(key).await
    }
}
