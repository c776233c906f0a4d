use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const BLOB_SCHEME: &str = "blob:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("Blob {0} does not exist or was already revoked")]
    NotFound(String),
}

/// In-memory store of encoded images addressed by revocable `blob:` URLs.
///
/// A blob stays alive until it is explicitly revoked; whoever created the URL owns that
/// obligation. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    blobs: Arc<DashMap<String, Bytes>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blob_url(url: &str) -> bool {
        url.starts_with(BLOB_SCHEME)
    }

    /// Register `bytes` and hand out a fresh URL for them
    pub fn create(&self, bytes: Bytes) -> String {
        let url = format!("{BLOB_SCHEME}vista/{}", Uuid::new_v4());
        tracing::trace!(url = %url, size = bytes.len(), "Created blob");
        self.blobs.insert(url.clone(), bytes);
        url
    }

    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.blobs.get(url).map(|bytes| bytes.value().clone())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.blobs.contains_key(url)
    }

    /// Release a blob, returning how many bytes were freed
    pub fn revoke(&self, url: &str) -> Result<usize, BlobError> {
        match self.blobs.remove(url) {
            Some((_, bytes)) => {
                tracing::trace!(url = %url, "Revoked blob");
                Ok(bytes.len())
            }
            None => Err(BlobError::NotFound(url.to_string())),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.blobs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.blobs.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_revoke() {
        let store = BlobStore::new();
        let url = store.create(Bytes::from_static(b"pixels"));
        assert!(BlobStore::is_blob_url(&url));
        assert_eq!(store.get(&url), Some(Bytes::from_static(b"pixels")));
        assert_eq!(store.total_bytes(), 6);

        assert_eq!(store.revoke(&url), Ok(6));
        assert_eq!(store.revoke(&url), Err(BlobError::NotFound(url.clone())));
        assert!(store.is_empty());
    }

    #[test]
    fn test_clones_share_storage() {
        let store = BlobStore::new();
        let other = store.clone();
        let url = store.create(Bytes::from_static(b"a"));
        assert!(other.contains(&url));
        other.revoke(&url).unwrap();
        assert!(!store.contains(&url));
    }

    #[test]
    fn test_urls_are_unique() {
        let store = BlobStore::new();
        let a = store.create(Bytes::new());
        let b = store.create(Bytes::new());
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
        let mut urls = store.urls();
        urls.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(urls, expected);
    }
}
