//! Namespace record storage
//!
//! One record per namespace known to this storage root, keyed by the raw
//! namespace id bytes.

use crate::error::SyncError;
use crate::types::NamespaceId;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::entries::{ENTRIES_TABLE, PENDING_BLOBS_TABLE};
use super::{prefix_end, Storage};

/// Table for namespace records (key: namespace id bytes, value: serialized NamespaceRecord)
pub(crate) const NAMESPACES_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("namespaces");

/// Durable lifecycle state of a namespace.
///
/// Only these two states are ever persisted; the transient states live on the
/// in-memory replica handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceState {
    /// Record written, initial setup not yet finished
    Creating,
    /// Ready for reads, writes and sync
    Active,
}

/// How a namespace came to exist locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceOrigin {
    /// Created on this device
    Created,
    /// Joined through a ticket
    Imported,
}

/// Persisted namespace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub id: NamespaceId,
    /// Nanoseconds since the Unix epoch
    pub created_at: u64,
    pub state: NamespaceState,
    pub origin: NamespaceOrigin,
}

impl NamespaceRecord {
    pub fn new(id: NamespaceId, created_at: u64, origin: NamespaceOrigin) -> Self {
        Self {
            id,
            created_at,
            state: NamespaceState::Creating,
            origin,
        }
    }
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Namespace Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a namespace record, overwriting any previous record with the same id
    pub fn save_namespace(&self, record: &NamespaceRecord) -> Result<(), SyncError> {
        let serialized = postcard::to_allocvec(record)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(NAMESPACES_TABLE)?;
            table.insert(record.id.as_bytes().as_slice(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a namespace record
    ///
    /// Returns `None` if the namespace doesn't exist locally.
    pub fn load_namespace(&self, id: &NamespaceId) -> Result<Option<NamespaceRecord>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(NAMESPACES_TABLE)?;

        match table.get(id.as_bytes().as_slice())? {
            Some(data) => {
                let record: NamespaceRecord = postcard::from_bytes(data.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all namespace records, oldest first
    pub fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(NAMESPACES_TABLE)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_key, value) = item?;
            let record: NamespaceRecord = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            records.push(record);
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Update the persisted state of an existing namespace
    pub fn set_namespace_state(
        &self,
        id: &NamespaceId,
        state: NamespaceState,
    ) -> Result<(), SyncError> {
        let mut record = self
            .load_namespace(id)?
            .ok_or_else(|| SyncError::NamespaceNotFound(id.to_string()))?;
        if record.state != state {
            record.state = state;
            self.save_namespace(&record)?;
        }
        Ok(())
    }

    /// Delete a namespace with all of its entries and pending blob records
    ///
    /// Returns `true` if the namespace existed. Blobs are left in place; they
    /// become collectable once no other namespace references them.
    pub fn delete_namespace(&self, id: &NamespaceId) -> Result<bool, SyncError> {
        let prefix = id.as_bytes().as_slice();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let existed = {
            let mut namespaces = write_txn.open_table(NAMESPACES_TABLE)?;
            let existed = namespaces.remove(prefix)?.is_some();

            let mut entries = write_txn.open_table(ENTRIES_TABLE)?;
            for key in collect_prefixed_keys(&entries, prefix)? {
                entries.remove(key.as_slice())?;
            }

            let mut pending = write_txn.open_table(PENDING_BLOBS_TABLE)?;
            for key in collect_prefixed_keys(&pending, prefix)? {
                pending.remove(key.as_slice())?;
            }

            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

/// Collect all keys of `table` that start with `prefix`
pub(crate) fn collect_prefixed_keys<T, V>(table: &T, prefix: &[u8]) -> Result<Vec<Vec<u8>>, SyncError>
where
    T: ReadableTable<&'static [u8], V>,
    V: redb::Value + 'static,
{
    let mut keys = Vec::new();
    let end = prefix_end(prefix);
    let range = match end.as_deref() {
        Some(end) => table.range::<&[u8]>(prefix..end)?,
        None => table.range::<&[u8]>(prefix..)?,
    };
    for item in range {
        let (key, _value) = item?;
        keys.push(key.value().to_vec());
    }
    Ok(keys)
}
