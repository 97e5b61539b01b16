//! Blob Store - iroh-blobs storage for file contents
//!
//! Blobs are identified by their BLAKE3 hash and stored once, no matter how
//! many entries or namespaces reference them. The store wraps an iroh-blobs
//! `FsStore` (or a `MemStore` for tests), which also serves blobs to peers
//! and verifies downloads against their hash while they stream in.
//!
//! # Retention
//!
//! The store runs without its own garbage collection; blobs only leave it
//! through [`BlobStore::retain`], which the engine drives from the set of
//! hashes its entries still reference.
//!
//! # Streaming
//!
//! [`BlobStore::put_file`] imports a file from disk and
//! [`BlobStore::export`] writes one back out, so large payloads never have to
//! fit in memory.
//!
//! # Example
//!
//! ```ignore
//! let store = BlobStore::persistent(&data_dir.join("blobs")).await?;
//! let hash = store.put(b"hello".to_vec()).await?;
//! assert_eq!(store.get(&hash).await?, "hello");
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use iroh::{Endpoint, PublicKey};
use iroh_blobs::api::blobs::BlobStatus;
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::store::mem::MemStore;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::types::{Hash, NodeId};

/// The underlying store type (memory or persistent)
#[derive(Clone)]
enum StoreInner {
    Memory(MemStore),
    Persistent(FsStore),
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreInner::Memory(_) => write!(f, "MemStore"),
            StoreInner::Persistent(_) => write!(f, "FsStore"),
        }
    }
}

/// Content-addressed blob store
#[derive(Clone)]
pub struct BlobStore {
    inner: StoreInner,
    store: iroh_blobs::api::Store,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("store", &self.inner)
            .finish()
    }
}

fn blob_error(action: &str, hash: &Hash, e: impl std::fmt::Display) -> SyncError {
    SyncError::Blob(format!("Failed to {} blob {}: {}", action, hash.fmt_short(), e))
}

impl BlobStore {
    /// Create a blob store kept in memory. Data is lost on drop.
    pub fn memory() -> Self {
        debug!("Creating in-memory blob store");
        let mem = MemStore::new();
        let store = mem.as_ref().clone();
        Self {
            inner: StoreInner::Memory(mem),
            store,
        }
    }

    /// Open (or create) a persistent blob store in `path`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Blob` if the directory cannot be created or the
    /// store cannot be loaded.
    pub async fn persistent(path: &Path) -> SyncResult<Self> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            SyncError::Blob(format!("Failed to create blob directory {}: {}", path.display(), e))
        })?;

        let fs = FsStore::load(path).await.map_err(|e| {
            SyncError::Blob(format!("Failed to load blob store at {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), "Opened blob store");

        let store = fs.clone().into();
        Ok(Self {
            inner: StoreInner::Persistent(fs),
            store,
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.inner, StoreInner::Persistent(_))
    }

    /// The iroh-blobs store handle, for serving blobs over an endpoint
    pub fn store(&self) -> iroh_blobs::api::Store {
        self.store.clone()
    }

    /// Store an in-memory payload, returning its hash.
    ///
    /// Idempotent: storing the same bytes again keeps one copy.
    pub async fn put(&self, data: impl Into<Bytes>) -> SyncResult<Hash> {
        let data: Bytes = data.into();
        let len = data.len();
        let tag = self
            .store
            .blobs()
            .add_bytes(data)
            .temp_tag()
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to import blob: {}", e)))?;

        let hash = Hash::from(tag.hash());
        debug!(hash = %hash.fmt_short(), len, "Stored blob");
        Ok(hash)
    }

    /// Import a file from disk, returning its hash and length
    pub async fn put_file(&self, source: &Path) -> SyncResult<(Hash, u64)> {
        // The store resolves paths on its own task
        let source = tokio::fs::canonicalize(source).await?;
        let tag = self
            .store
            .blobs()
            .add_path(&source)
            .temp_tag()
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to import {}: {}", source.display(), e)))?;

        let hash = Hash::from(tag.hash());
        let len = self.size(&hash).await?.unwrap_or_default();
        debug!(hash = %hash.fmt_short(), len, source = %source.display(), "Imported file");
        Ok((hash, len))
    }

    /// Read a whole blob into memory
    pub async fn get(&self, hash: &Hash) -> SyncResult<Bytes> {
        if !self.has(hash).await? {
            return Err(SyncError::BlobNotFound(hash.to_hex()));
        }
        self.store
            .blobs()
            .get_bytes(iroh_blobs::Hash::from(*hash))
            .await
            .map_err(|e| blob_error("read", hash, e))
    }

    /// Write a blob to an external file, creating parent directories as needed
    pub async fn export(&self, hash: &Hash, dest: impl AsRef<Path>) -> SyncResult<u64> {
        if !self.has(hash).await? {
            return Err(SyncError::BlobNotFound(hash.to_hex()));
        }

        let dest = absolute(dest.as_ref())?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.store
            .blobs()
            .export(iroh_blobs::Hash::from(*hash), &dest)
            .await
            .map_err(|e| blob_error("export", hash, e))?;

        let copied = tokio::fs::metadata(&dest).await?.len();
        debug!(hash = %hash.fmt_short(), dest = %dest.display(), copied, "Exported blob");
        Ok(copied)
    }

    /// Whether a blob is completely present
    pub async fn has(&self, hash: &Hash) -> SyncResult<bool> {
        self.store
            .blobs()
            .has(iroh_blobs::Hash::from(*hash))
            .await
            .map_err(|e| blob_error("check", hash, e))
    }

    /// Size of a complete blob in bytes, `None` if absent or partial
    pub async fn size(&self, hash: &Hash) -> SyncResult<Option<u64>> {
        let status = self
            .store
            .blobs()
            .status(iroh_blobs::Hash::from(*hash))
            .await
            .map_err(|e| blob_error("query", hash, e))?;

        match status {
            BlobStatus::Complete { size, .. } => Ok(Some(size)),
            BlobStatus::Partial { .. } | BlobStatus::NotFound => Ok(None),
        }
    }

    /// All stored blob hashes, sorted
    pub async fn list(&self) -> SyncResult<Vec<Hash>> {
        let listed = self
            .store
            .blobs()
            .list()
            .hashes()
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to list blobs: {}", e)))?;

        let mut hashes: Vec<Hash> = listed.into_iter().map(Hash::from).collect();
        hashes.sort();
        hashes.dedup();
        Ok(hashes)
    }

    /// Number of stored blobs
    pub async fn count(&self) -> SyncResult<usize> {
        Ok(self.list().await?.len())
    }

    /// Delete every blob not in `live`, returning how many were removed
    pub async fn retain(&self, live: &HashSet<Hash>) -> SyncResult<usize> {
        let dead: Vec<Hash> = self
            .list()
            .await?
            .into_iter()
            .filter(|hash| !live.contains(hash))
            .collect();
        if !dead.is_empty() {
            self.store
                .blobs()
                .delete(dead.iter().copied().map(iroh_blobs::Hash::from))
                .await
                .map_err(|e| SyncError::Blob(format!("Failed to delete blobs: {}", e)))?;
        }

        info!(removed = dead.len(), kept = live.len(), "Blob garbage collection finished");
        Ok(dead.len())
    }

    /// Download `hash` from `from` over `endpoint`.
    ///
    /// Returns whether the blob is complete afterwards. The remote may lack
    /// the blob or refuse to serve it; both leave nothing behind.
    pub async fn download(&self, endpoint: &Endpoint, from: NodeId, hash: &Hash) -> SyncResult<bool> {
        if self.has(hash).await? {
            return Ok(true);
        }
        let provider = PublicKey::try_from(from)?;
        debug!(hash = %hash.fmt_short(), peer = %from.fmt_short(), "Downloading blob");

        use n0_future::StreamExt;
        let downloader = self.store.downloader(endpoint);
        let mut progress = downloader
            .download(iroh_blobs::Hash::from(*hash), vec![provider])
            .stream()
            .await
            .map_err(|e| blob_error("download", hash, e))?;
        while let Some(event) = progress.next().await {
            debug!(hash = %hash.fmt_short(), ?event, "Download progress");
        }

        let complete = self.has(hash).await?;
        debug!(hash = %hash.fmt_short(), complete, "Blob download finished");
        Ok(complete)
    }

    /// Stop the store's background tasks, flushing persistent state
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.store
            .shutdown()
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to shut blob store down: {}", e)))
    }
}

fn absolute(path: &Path) -> SyncResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = BlobStore::memory();
        let hash = store.put(b"hello world".to_vec()).await.unwrap();
        assert_eq!(hash, Hash::new(b"hello world"));
        assert_eq!(store.get(&hash).await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = BlobStore::memory();
        let h1 = store.put(b"same".to_vec()).await.unwrap();
        let h2 = store.put(b"same".to_vec()).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.count().await.unwrap(), 1);

        store.put(b"different".to_vec()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_missing_blob() {
        let store = BlobStore::memory();
        let err = store.get(&Hash::new(b"never stored")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.size(&Hash::new(b"never stored")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_blob() {
        let store = BlobStore::memory();
        let hash = store.put(Bytes::new()).await.unwrap();
        assert_eq!(hash, Hash::empty());
        assert!(store.get(&hash).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_file_imports_large_payload() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::persistent(&temp.path().join("blobs")).await.unwrap();
        let data: Vec<u8> = (0..(3 * 1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
        let source = temp.path().join("large.bin");
        std::fs::write(&source, &data).unwrap();

        let (hash, len) = store.put_file(&source).await.unwrap();
        assert_eq!(hash, Hash::new(&data));
        assert_eq!(len, data.len() as u64);
        assert_eq!(store.size(&hash).await.unwrap(), Some(len));
    }

    #[tokio::test]
    async fn test_put_file_missing_source() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::memory();
        let err = store.put_file(&temp.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[tokio::test]
    async fn test_export() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::memory();
        let hash = store.put(b"exported".to_vec()).await.unwrap();

        let dest = temp.path().join("out/nested/file.txt");
        let copied = store.export(&hash, &dest).await.unwrap();
        assert_eq!(copied, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"exported");
    }

    #[tokio::test]
    async fn test_export_missing_blob() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::memory();
        let err = store
            .export(&Hash::new(b"nope"), temp.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!temp.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_retain_removes_unreferenced() {
        let store = BlobStore::memory();
        let keep = store.put(b"keep".to_vec()).await.unwrap();
        let drop_me = store.put(b"drop".to_vec()).await.unwrap();

        let live: HashSet<Hash> = [keep].into_iter().collect();
        assert_eq!(store.retain(&live).await.unwrap(), 1);
        assert!(store.has(&keep).await.unwrap());
        assert!(!store.has(&drop_me).await.unwrap());
        assert_eq!(store.retain(&live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistent_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blobs");

        let hash = {
            let store = BlobStore::persistent(&path).await.unwrap();
            assert!(store.is_persistent());
            let hash = store.put(b"durable".to_vec()).await.unwrap();
            store.shutdown().await.unwrap();
            hash
        };

        let store = BlobStore::persistent(&path).await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), Bytes::from_static(b"durable"));
    }
}
