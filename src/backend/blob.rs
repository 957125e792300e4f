//! File Blob Storage
//!
//! Decoded upload bytes go through the [`BlobStore`] trait before any
//! database row is written, so a storage failure can abort the operation
//! with nothing persisted. The local store writes under a configured
//! uploads directory with uuid-uniquified names; the in-memory store backs
//! the test suite.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// Where raw attachment bytes live.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` under a name derived from `original_filename` and
    /// return the stable URL recorded in the attachment row.
    async fn put(&self, original_filename: &str, bytes: &[u8]) -> Result<String, String>;

    /// Best-effort removal of a previously stored blob. Callers treat
    /// failure as non-fatal and log it.
    async fn remove(&self, file_url: &str) -> Result<(), String>;
}

/// Uniquify a client-supplied filename so concurrent uploads of the same
/// name never collide on disk.
fn unique_name(original_filename: &str) -> String {
    let safe: String = original_filename
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}", Uuid::new_v4(), safe)
}

/// Filesystem-backed blob store rooted at an uploads directory.
pub struct LocalBlobStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self { root: root.into(), url_prefix: url_prefix.into() }
    }

    fn path_for(&self, file_url: &str) -> Option<PathBuf> {
        let name = file_url.strip_prefix(&self.url_prefix)?.trim_start_matches('/');
        // Reject anything that could escape the uploads directory.
        if name.is_empty() || name.contains("..") || name.contains('/') {
            return None;
        }
        Some(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, original_filename: &str, bytes: &[u8]) -> Result<String, String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| format!("Failed to create uploads directory: {}", e))?;

        let name = unique_name(original_filename);
        let path = self.root.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| format!("Failed to write file: {}", e))?;

        debug!("[Blob] Stored {} bytes at {:?}", bytes.len(), path);
        Ok(format!("{}/{}", self.url_prefix.trim_end_matches('/'), name))
    }

    async fn remove(&self, file_url: &str) -> Result<(), String> {
        let path = self
            .path_for(file_url)
            .ok_or_else(|| format!("Unrecognized file URL: {}", file_url))?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| format!("Failed to remove file: {}", e))
    }
}

/// In-memory blob store for tests and database-less runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held.
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve stored bytes, if present.
    pub fn get(&self, file_url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(file_url).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, original_filename: &str, bytes: &[u8]) -> Result<String, String> {
        let url = format!("/uploads/{}", unique_name(original_filename));
        let mut blobs = self.blobs.lock().map_err(|_| "blob store poisoned".to_string())?;
        blobs.insert(url.clone(), bytes.to_vec());
        Ok(url)
    }

    async fn remove(&self, file_url: &str) -> Result<(), String> {
        let mut blobs = self.blobs.lock().map_err(|_| "blob store poisoned".to_string())?;
        blobs
            .remove(file_url)
            .map(|_| ())
            .ok_or_else(|| format!("No blob at {}", file_url))
    }
}
