//! Media/storage adapter.
//!
//! Binary objects (photos, attachments) live in an external object store.
//! Entities only carry the URL the store returns, as an opaque field.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors reported by a media store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object path: {0:?}")]
    InvalidPath(String),

    #[error("upload failed: {0}")]
    Upload(String),
}

/// An object store for binary attachments.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store `bytes` at `path`, replacing any previous object. Returns the
    /// URL under which the object can be fetched.
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<String, MediaError>;

    /// Delete the object at `path`.
    async fn delete(&self, path: &str) -> Result<(), MediaError>;
}

/// In-memory media store for testing.
pub struct MemoryMediaStore {
    base_url: String,
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryMediaStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// The object stored at `path`.
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// URL of the object at `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl Default for MemoryMediaStore {
    fn default() -> Self {
        Self::new("memory://media")
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<String, MediaError> {
        if path.is_empty() || path.starts_with('/') {
            return Err(MediaError::InvalidPath(path.to_string()));
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), bytes);
        Ok(self.url(path))
    }

    async fn delete(&self, path: &str) -> Result<(), MediaError> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MediaError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_returns_url() {
        let media = MemoryMediaStore::new("https://cdn.example/");
        let url = media
            .upload("alice/photo.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/alice/photo.jpg");
        assert_eq!(media.get("alice/photo.jpg").unwrap(), Bytes::from_static(b"jpeg"));
    }

    #[tokio::test]
    async fn test_delete_missing_object() {
        let media = MemoryMediaStore::default();
        assert_eq!(
            media.delete("nope").await,
            Err(MediaError::NotFound("nope".into()))
        );
        assert!(media.upload("", Bytes::new()).await.is_err());
        assert!(media.is_empty());
    }
}
