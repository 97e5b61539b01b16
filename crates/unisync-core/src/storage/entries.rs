//! Entry and pending blob storage
//!
//! ## Storage Design
//!
//! - **entries**: key `namespace ‖ author ‖ path`, value is a serialized
//!   `SignedEntry`. Each author keeps only its newest entry per path.
//! - **pending_blobs**: key `namespace ‖ hash`, value is the expected blob
//!   length. Records content referenced by an adopted entry that has not been
//!   fetched yet.
//!
//! Installing an entry and recording its missing blob happen in the same
//! write transaction, so a crash never leaves one without the other.

use crate::error::SyncError;
use crate::types::{AuthorId, Hash, NamespaceId, SignedEntry};
use redb::{ReadableTable, TableDefinition};

use super::namespaces::collect_prefixed_keys;
use super::{prefix_end, Storage};

/// Table for signed entries (key: namespace ‖ author ‖ path)
pub(crate) const ENTRIES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

/// Table for blobs still to be fetched (key: namespace ‖ hash, value: length)
pub(crate) const PENDING_BLOBS_TABLE: TableDefinition<&[u8], u64> =
    TableDefinition::new("pending_blobs");

/// Result of offering an entry to storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry replaced (or became) the author's entry for its path
    Stored,
    /// The author already has an equal or newer entry for the path
    Stale,
}

fn entry_key(namespace: &NamespaceId, author: &AuthorId, path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(64 + path.len());
    key.extend_from_slice(namespace.as_bytes());
    key.extend_from_slice(author.as_bytes());
    key.extend_from_slice(path.as_bytes());
    key
}

fn pending_key(namespace: &NamespaceId, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(namespace.as_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn decode_entry(bytes: &[u8]) -> Result<SignedEntry, SyncError> {
    postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Entry Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Store an entry if it is newer than the author's current entry for the path
    ///
    /// When `missing_blob` is set and the entry is stored, its hash is recorded
    /// in the pending blob table within the same transaction. `release` names
    /// the hash of the entry this one displaces; its pending record is dropped
    /// in that transaction too, so a superseded download is never retried.
    pub fn store_entry(
        &self,
        signed: &SignedEntry,
        missing_blob: bool,
        release: Option<&Hash>,
    ) -> Result<ApplyOutcome, SyncError> {
        let entry = &signed.entry;
        let key = entry_key(&entry.namespace, &entry.author, &entry.path);
        let serialized =
            postcard::to_allocvec(signed).map_err(|e| SyncError::Serialization(e.to_string()))?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let outcome = {
            let mut entries = write_txn.open_table(ENTRIES_TABLE)?;

            let existing = match entries.get(key.as_slice())? {
                Some(data) => Some(decode_entry(data.value())?),
                None => None,
            };

            match existing {
                Some(existing) if !entry.supersedes(&existing.entry) => ApplyOutcome::Stale,
                _ => {
                    entries.insert(key.as_slice(), serialized.as_slice())?;
                    let mut pending = write_txn.open_table(PENDING_BLOBS_TABLE)?;
                    if let Some(released) = release.filter(|h| **h != entry.hash) {
                        pending.remove(pending_key(&entry.namespace, released).as_slice())?;
                    }
                    if missing_blob {
                        pending.insert(
                            pending_key(&entry.namespace, &entry.hash).as_slice(),
                            entry.length,
                        )?;
                    }
                    ApplyOutcome::Stored
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Load one author's entry for a path
    pub fn load_entry(
        &self,
        namespace: &NamespaceId,
        author: &AuthorId,
        path: &str,
    ) -> Result<Option<SignedEntry>, SyncError> {
        let key = entry_key(namespace, author, path);

        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;

        match table.get(key.as_slice())? {
            Some(data) => Ok(Some(decode_entry(data.value())?)),
            None => Ok(None),
        }
    }

    /// Load every stored entry of a namespace, from all authors
    pub fn load_entries(&self, namespace: &NamespaceId) -> Result<Vec<SignedEntry>, SyncError> {
        let prefix = namespace.as_bytes().as_slice();
        let end = prefix_end(prefix);

        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;

        let range = match end.as_deref() {
            Some(end) => table.range::<&[u8]>(prefix..end)?,
            None => table.range::<&[u8]>(prefix..)?,
        };

        let mut entries = Vec::new();
        for item in range {
            let (_key, value) = item?;
            entries.push(decode_entry(value.value())?);
        }
        Ok(entries)
    }

    /// Whether any stored entry of the namespace references `hash`
    pub fn namespace_references(
        &self,
        namespace: &NamespaceId,
        hash: &Hash,
    ) -> Result<bool, SyncError> {
        Ok(self
            .load_entries(namespace)?
            .iter()
            .any(|signed| signed.entry.hash == *hash))
    }

    /// Hashes referenced by any stored entry, across all namespaces
    pub fn referenced_hashes(&self) -> Result<Vec<Hash>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;

        let mut hashes = Vec::new();
        for item in table.iter()? {
            let (_key, value) = item?;
            hashes.push(decode_entry(value.value())?.entry.hash);
        }
        hashes.sort();
        hashes.dedup();
        Ok(hashes)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pending Blob Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Blobs a namespace still needs, with their expected lengths
    pub fn pending_blobs(&self, namespace: &NamespaceId) -> Result<Vec<(Hash, u64)>, SyncError> {
        let prefix = namespace.as_bytes().as_slice();
        let end = prefix_end(prefix);

        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(PENDING_BLOBS_TABLE)?;

        let range = match end.as_deref() {
            Some(end) => table.range::<&[u8]>(prefix..end)?,
            None => table.range::<&[u8]>(prefix..)?,
        };

        let mut pending = Vec::new();
        for item in range {
            let (key, value) = item?;
            let key = key.value();
            let hash_bytes: [u8; 32] = key[32..].try_into().map_err(|_| {
                SyncError::Storage(format!("Corrupt pending blob key of {} bytes", key.len()))
            })?;
            pending.push((Hash::from_bytes(hash_bytes), value.value()));
        }
        Ok(pending)
    }

    /// Forget a pending blob in every namespace that was waiting for it
    pub fn resolve_pending_blob(&self, hash: &Hash) -> Result<(), SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_BLOBS_TABLE)?;
            let mut keys = Vec::new();
            for item in table.iter()? {
                let (key, _value) = item?;
                let key = key.value();
                if key.len() == 64 && &key[32..] == hash.as_bytes().as_slice() {
                    keys.push(key.to_vec());
                }
            }
            for key in keys {
                table.remove(key.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop all pending blob records of a namespace
    pub fn clear_pending_blobs(&self, namespace: &NamespaceId) -> Result<(), SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_BLOBS_TABLE)?;
            for key in collect_prefixed_keys(&table, namespace.as_bytes().as_slice())? {
                table.remove(key.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Author;
    use crate::types::Entry;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    fn signed(author: &Author, ns: NamespaceId, path: &str, ts: u64, content: &[u8]) -> SignedEntry {
        let entry = Entry::new(
            ns,
            path,
            author.id(),
            ts,
            Hash::new(content),
            content.len() as u64,
        );
        author.sign(entry).unwrap()
    }

    #[test]
    fn test_store_and_load_entry() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();
        let e = signed(&author, ns, "a.txt", 10, b"v1");

        assert_eq!(storage.store_entry(&e, false, None).unwrap(), ApplyOutcome::Stored);
        let loaded = storage.load_entry(&ns, &author.id(), "a.txt").unwrap().unwrap();
        assert_eq!(loaded, e);
    }

    #[test]
    fn test_older_entry_from_same_author_is_stale() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();
        let newer = signed(&author, ns, "a.txt", 20, b"v2");
        let older = signed(&author, ns, "a.txt", 10, b"v1");

        storage.store_entry(&newer, false, None).unwrap();
        assert_eq!(storage.store_entry(&older, false, None).unwrap(), ApplyOutcome::Stale);
        assert_eq!(storage.store_entry(&newer, false, None).unwrap(), ApplyOutcome::Stale);

        let loaded = storage.load_entry(&ns, &author.id(), "a.txt").unwrap().unwrap();
        assert_eq!(loaded.entry.timestamp, 20);
    }

    #[test]
    fn test_load_entries_is_scoped_to_namespace() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns1 = NamespaceId::generate().unwrap();
        let ns2 = NamespaceId::generate().unwrap();

        storage.store_entry(&signed(&author, ns1, "a", 1, b"1"), false, None).unwrap();
        storage.store_entry(&signed(&author, ns1, "b", 1, b"2"), false, None).unwrap();
        storage.store_entry(&signed(&author, ns2, "c", 1, b"3"), false, None).unwrap();

        assert_eq!(storage.load_entries(&ns1).unwrap().len(), 2);
        assert_eq!(storage.load_entries(&ns2).unwrap().len(), 1);
    }

    #[test]
    fn test_pending_blob_recorded_with_entry() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();
        let e = signed(&author, ns, "a.txt", 10, b"remote");

        storage.store_entry(&e, true, None).unwrap();
        assert_eq!(storage.pending_blobs(&ns).unwrap(), vec![(e.entry.hash, 6)]);

        storage.resolve_pending_blob(&e.entry.hash).unwrap();
        assert!(storage.pending_blobs(&ns).unwrap().is_empty());
    }

    #[test]
    fn test_stale_entry_does_not_record_pending_blob() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();

        storage.store_entry(&signed(&author, ns, "a", 20, b"new"), false, None).unwrap();
        storage.store_entry(&signed(&author, ns, "a", 10, b"old"), true, None).unwrap();
        assert!(storage.pending_blobs(&ns).unwrap().is_empty());
    }

    #[test]
    fn test_released_hash_drops_pending_record() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();
        let old = signed(&author, ns, "a", 10, b"old");
        let new = signed(&author, ns, "a", 20, b"new");

        storage.store_entry(&old, true, None).unwrap();
        storage.store_entry(&new, false, Some(&old.entry.hash)).unwrap();
        assert!(storage.pending_blobs(&ns).unwrap().is_empty());
    }

    #[test]
    fn test_stale_entry_keeps_released_record() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();
        let current = signed(&author, ns, "a", 20, b"current");

        storage.store_entry(&current, true, None).unwrap();
        let outcome = storage
            .store_entry(&signed(&author, ns, "a", 10, b"old"), false, Some(&current.entry.hash))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(storage.pending_blobs(&ns).unwrap().len(), 1);
    }

    #[test]
    fn test_namespace_references() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();
        let other = NamespaceId::generate().unwrap();
        let e = signed(&author, ns, "a", 10, b"shared");

        storage.store_entry(&e, false, None).unwrap();
        assert!(storage.namespace_references(&ns, &e.entry.hash).unwrap());
        assert!(!storage.namespace_references(&other, &e.entry.hash).unwrap());
    }

    #[test]
    fn test_clear_pending_blobs() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();

        storage.store_entry(&signed(&author, ns, "a", 1, b"x"), true, None).unwrap();
        storage.store_entry(&signed(&author, ns, "b", 1, b"y"), true, None).unwrap();
        assert_eq!(storage.pending_blobs(&ns).unwrap().len(), 2);

        storage.clear_pending_blobs(&ns).unwrap();
        assert!(storage.pending_blobs(&ns).unwrap().is_empty());
    }

    #[test]
    fn test_referenced_hashes_dedup() {
        let (storage, _temp) = create_test_storage();
        let author = Author::generate().unwrap();
        let ns = NamespaceId::generate().unwrap();

        storage.store_entry(&signed(&author, ns, "a", 1, b"same"), false, None).unwrap();
        storage.store_entry(&signed(&author, ns, "b", 1, b"same"), false, None).unwrap();
        assert_eq!(storage.referenced_hashes().unwrap(), vec![Hash::new(b"same")]);
    }
}
