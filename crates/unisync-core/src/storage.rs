//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Namespace records
//! - Signed entries, keyed by `(namespace, author, path)`
//! - Blobs adopted from peers whose content is still being fetched
//! - Engine metadata (author key, endpoint secret key)
//!
//! Blob contents live outside the database, see [`crate::blobs`].

use crate::error::SyncError;
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Submodules
mod entries;
mod namespaces;

use entries::{ENTRIES_TABLE, PENDING_BLOBS_TABLE};
use namespaces::NAMESPACES_TABLE;

pub use entries::ApplyOutcome;
pub use namespaces::{NamespaceOrigin, NamespaceRecord, NamespaceState};

// Table definitions
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Get a reference to the shared database handle
    ///
    /// This allows other components (like NodeDirectory) to share the same
    /// database connection instead of opening multiple instances of the same file.
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(NAMESPACES_TABLE)?;
            let _ = write_txn.open_table(ENTRIES_TABLE)?;
            let _ = write_txn.open_table(PENDING_BLOBS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Metadata Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Author signing key storage key (there's only one author per storage root)
    pub(crate) const AUTHOR_KEY: &'static str = "author_secret_key";

    /// Endpoint secret key storage key (there's only one endpoint per node)
    pub(crate) const ENDPOINT_SECRET_KEY: &'static str = "endpoint_secret_key";

    /// Store a metadata value under a fixed key, overwriting any previous value.
    pub fn save_meta(&self, key: &str, value: &[u8]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a metadata value.
    ///
    /// Returns `None` if nothing was stored under `key`.
    pub fn load_meta(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Load a 32-byte secret stored under `key`.
    pub fn load_secret(&self, key: &str) -> Result<Option<[u8; 32]>, SyncError> {
        match self.load_meta(key)? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
                    SyncError::Storage(format!(
                        "Corrupt secret '{}': expected 32 bytes, got {}",
                        key,
                        v.len()
                    ))
                })?;
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }

    /// Load the 32-byte secret under `key`, generating and persisting one on first use.
    pub fn load_or_create_secret(&self, key: &str) -> Result<[u8; 32], SyncError> {
        if let Some(secret) = self.load_secret(key)? {
            return Ok(secret);
        }
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret)
            .map_err(|e| SyncError::Internal(format!("Failed to get random bytes: {}", e)))?;
        self.save_meta(key, &secret)?;
        Ok(secret)
    }
}

/// Exclusive upper bound for keys starting with `prefix`.
///
/// Returns `None` when every prefix byte is `0xFF` (no finite bound).
pub(crate) fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
