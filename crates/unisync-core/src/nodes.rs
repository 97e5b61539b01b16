//! Node directory for tracking known peers and driving reconnection
//!
//! This module keeps a persistent record of every node this device has
//! learned about, through a ticket or through a completed sync handshake in
//! either direction. The directory enables:
//! - Picking sync targets for a namespace
//! - Re-probing previously seen nodes after a network interruption
//! - Offline bookkeeping of address hints and connection statistics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Node Discovery Flow                                            │
//! │  1. Ticket import or handshake yields a NodeAddr                │
//! │  2. upsert() merges address hints and namespace tags            │
//! │  3. Record stored in redb, keyed by node id                     │
//! │  4. reconnect() probes every record and updates its status      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are never evicted automatically; [`NodeDirectory::remove`] is the
//! only way to forget a node.

use crate::error::SyncError;
use crate::types::{NamespaceId, NodeAddr, NodeId};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// Table definition for the node directory
const NODES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("nodes");

/// Connection status of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Last probe or session succeeded
    Online,
    /// Last probe or session failed
    Offline,
    /// Never attempted
    #[default]
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// How we first learned about a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSource {
    /// Listed in an imported ticket
    Ticket,
    /// Connected to us
    Inbound,
    /// We connected to it
    Outbound,
}

/// Everything we know about a remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Last known address hints
    pub addr: NodeAddr,
    /// How we discovered this node
    pub source: NodeSource,
    /// Namespaces this node is known to hold
    pub namespaces: Vec<NamespaceId>,
    /// Current connection status
    pub status: NodeStatus,
    /// When the record was created (Unix seconds)
    pub first_seen: u64,
    /// Last successful contact (Unix seconds), 0 if never
    pub last_seen: u64,
    /// Total number of connection attempts
    pub connection_attempts: u32,
    /// Number of successful connections
    pub successful_connections: u32,
    /// Last connection attempt (Unix seconds), 0 if never
    pub last_attempt: u64,
}

impl NodeRecord {
    /// Create a new record for `addr`
    pub fn new(addr: NodeAddr, source: NodeSource) -> Self {
        Self {
            addr,
            source,
            namespaces: Vec::new(),
            status: NodeStatus::Unknown,
            first_seen: current_timestamp(),
            last_seen: 0,
            connection_attempts: 0,
            successful_connections: 0,
            last_attempt: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.addr.node_id
    }

    /// Add a namespace tag if not already present
    pub fn add_namespace(&mut self, namespace: NamespaceId) -> bool {
        if self.namespaces.contains(&namespace) {
            return false;
        }
        self.namespaces.push(namespace);
        true
    }

    pub fn holds(&self, namespace: &NamespaceId) -> bool {
        self.namespaces.contains(namespace)
    }

    /// Record a connection attempt
    pub fn record_attempt(&mut self) {
        self.connection_attempts = self.connection_attempts.saturating_add(1);
        self.last_attempt = current_timestamp();
    }

    /// Record a successful connection
    pub fn record_success(&mut self) {
        self.successful_connections = self.successful_connections.saturating_add(1);
        self.status = NodeStatus::Online;
        self.last_seen = current_timestamp();
    }

    /// Record a connection failure
    pub fn record_failure(&mut self) {
        self.status = NodeStatus::Offline;
    }
}

/// Get current Unix timestamp
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Result of probing known nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectSummary {
    /// Nodes probed
    pub attempted: usize,
    /// Nodes that answered
    pub reachable: Vec<NodeId>,
    /// Nodes that did not, with the reason
    pub unreachable: Vec<(NodeId, String)>,
}

/// Outcome of a connection, for directory bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Success,
    Failure,
}

/// Persistent registry of known nodes
#[derive(Clone)]
pub struct NodeDirectory {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDirectory").finish_non_exhaustive()
    }
}

impl NodeDirectory {
    /// Create a node directory using the same database as Storage
    ///
    /// This reuses the existing database connection to avoid having multiple
    /// database instances pointing at the same file.
    pub fn new(db: Arc<RwLock<Database>>) -> Result<Self, SyncError> {
        // Initialize the nodes table if it doesn't exist
        {
            let database = db.read();
            let write_txn = database.begin_write()?;
            {
                let _ = write_txn.open_table(NODES_TABLE)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db })
    }

    /// Apply `update` to the record of `id` inside one write transaction.
    ///
    /// `create` supplies a fresh record when none exists; without it a missing
    /// record is left alone and `None` is returned.
    fn modify<F>(
        &self,
        id: &NodeId,
        create: Option<NodeRecord>,
        update: F,
    ) -> Result<Option<NodeRecord>, SyncError>
    where
        F: FnOnce(&mut NodeRecord),
    {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(NODES_TABLE)?;
            let key = id.as_bytes().as_slice();

            let existing: Option<NodeRecord> = match table.get(key)? {
                Some(v) => Some(
                    postcard::from_bytes(v.value())
                        .map_err(|e| SyncError::Serialization(e.to_string()))?,
                ),
                None => None,
            };

            match existing.or(create) {
                Some(mut record) => {
                    update(&mut record);
                    let data = postcard::to_allocvec(&record)
                        .map_err(|e| SyncError::Serialization(e.to_string()))?;
                    table.insert(key, data.as_slice())?;
                    Some(record)
                }
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// Add a node or merge new information into its record
    ///
    /// Address hints are merged, the namespace (if any) is added to the tag
    /// list, and an existing record is never duplicated.
    pub fn upsert(
        &self,
        addr: &NodeAddr,
        source: NodeSource,
        namespace: Option<NamespaceId>,
    ) -> Result<NodeRecord, SyncError> {
        let fresh = NodeRecord::new(addr.clone(), source);
        let record = self.modify(&addr.node_id, Some(fresh), |record| {
            record.addr.merge(addr);
            if let Some(ns) = namespace {
                record.add_namespace(ns);
            }
        })?;
        record.ok_or_else(|| SyncError::Internal("Upsert produced no record".into()))
    }

    /// Record the outcome of a connection attempt to `id`
    pub fn record_connection(
        &self,
        id: &NodeId,
        outcome: ConnectionOutcome,
    ) -> Result<Option<NodeRecord>, SyncError> {
        self.modify(id, None, |record| {
            record.record_attempt();
            match outcome {
                ConnectionOutcome::Success => record.record_success(),
                ConnectionOutcome::Failure => record.record_failure(),
            }
        })
    }

    /// Get a node's record by id
    pub fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NODES_TABLE)?;

        match table.get(id.as_bytes().as_slice())? {
            Some(v) => {
                let record: NodeRecord = postcard::from_bytes(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all records
    pub fn list(&self) -> Result<Vec<NodeRecord>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NODES_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: NodeRecord = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Ids of nodes this node has completed a handshake with.
    ///
    /// Ticket addresses that were never reached stay in the directory as sync
    /// candidates but are not known nodes.
    pub fn known_nodes(&self) -> Result<Vec<NodeId>, SyncError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.successful_connections > 0)
            .map(|r| r.node_id())
            .collect())
    }

    /// Nodes tagged with `namespace`, the only ones it is synced with
    pub fn sync_targets(&self, namespace: &NamespaceId) -> Result<Vec<NodeRecord>, SyncError> {
        Ok(self.list()?.into_iter().filter(|r| r.holds(namespace)).collect())
    }

    /// Tag a known node with a namespace it holds
    pub fn tag_namespace(&self, id: &NodeId, namespace: NamespaceId) -> Result<(), SyncError> {
        self.modify(id, None, |record| {
            record.add_namespace(namespace);
        })?;
        Ok(())
    }

    /// Drop a namespace tag from every node
    pub fn untag_namespace(&self, namespace: &NamespaceId) -> Result<(), SyncError> {
        for record in self.list()? {
            if record.holds(namespace) {
                self.modify(&record.node_id(), None, |r| {
                    r.namespaces.retain(|ns| ns != namespace);
                })?;
            }
        }
        Ok(())
    }

    /// Forget a node. Returns `true` if it was known.
    pub fn remove(&self, id: &NodeId) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(NODES_TABLE)?;
            let removed = table.remove(id.as_bytes().as_slice())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Count total nodes in the directory
    pub fn count(&self) -> Result<usize, SyncError> {
        Ok(self.list()?.len())
    }
}
