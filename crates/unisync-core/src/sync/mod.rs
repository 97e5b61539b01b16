//! Point-to-point namespace sync
//!
//! ## Overview
//!
//! A sync round connects to every node known to hold a namespace and runs
//! one session with each. A session exchanges entry heads, ships the entries
//! each side is missing, then pulls the blob contents those entries refer to
//! over the transport's blob fetcher.
//! Both sides end a session with the same current entries for the namespace;
//! blobs that could not be fetched stay recorded as pending and are retried
//! by the next round.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Transport (iroh QUIC or in-process memory network)             │
//! │  ├── connect(addr) -> PeerStream    (outbound sessions)         │
//! │  ├── fetch_blob(addr, hash)         (verified blob download)    │
//! │  └── InboundHandler                 (inbound sessions, blob ACL)│
//! │                                                                 │
//! │  FramedStream (length-delimited postcard messages)              │
//! │                                                                 │
//! │  session::sync_round (client side)                              │
//! │  ├── dials every sync target concurrently                       │
//! │  └── collects a SyncReport with one PeerReport per node         │
//! │                                                                 │
//! │  SyncHandler (server side)                                      │
//! │  └── answers Offer / Push / Ping                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let ctx = Arc::new(SyncContext::new(replicas, nodes, blobs, storage, SyncOptions::default()));
//! let handler = Arc::new(SyncHandler::new(ctx.clone()));
//! let transport = MemoryNetwork::new().bind(node_id, handler, blobs.clone());
//!
//! let report = session::sync_round(&ctx, &transport, namespace).await;
//! for peer in &report.peers {
//!     println!("{}: {:?}", peer.node, peer.result);
//! }
//! ```

pub mod handler;
pub mod iroh_transport;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use crate::blobs::BlobStore;
use crate::error::{SyncError, SyncResult};
use crate::nodes::NodeDirectory;
use crate::replica::Replicas;
use crate::storage::Storage;
use crate::types::{Hash, NamespaceId, NodeId};

pub use handler::SyncHandler;
pub use iroh_transport::{IrohOptions, IrohTransport};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{Message, DEFAULT_MAX_FRAME_LEN, SYNC_ALPN};
pub use transport::{BlobFetcher, BoxedStream, InboundHandler, PeerStream, SharedTransport, Transport};

/// Limits applied to every sync session
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Time allowed to establish a connection and complete the handshake
    pub connect_timeout: Duration,
    /// Time allowed between two frames from a peer
    pub io_timeout: Duration,
    /// Time allowed for a whole session with one peer
    pub peer_timeout: Duration,
    /// Largest accepted frame
    pub max_frame_len: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(120),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// State shared by inbound and outbound sessions
#[derive(Debug)]
pub struct SyncContext {
    pub replicas: Arc<Replicas>,
    pub nodes: NodeDirectory,
    pub blobs: BlobStore,
    pub storage: Storage,
    pub options: SyncOptions,
}

impl SyncContext {
    pub fn new(
        replicas: Arc<Replicas>,
        nodes: NodeDirectory,
        blobs: BlobStore,
        storage: Storage,
        options: SyncOptions,
    ) -> Self {
        Self {
            replicas,
            nodes,
            blobs,
            storage,
            options,
        }
    }

    /// Whether `peer` may download `hash` from this node.
    ///
    /// Only blobs referenced by a namespace the peer is known to hold are
    /// served.
    pub fn may_serve_blob(&self, peer: &NodeId, hash: &Hash) -> SyncResult<bool> {
        let Some(record) = self.nodes.get(peer)? else {
            return Ok(false);
        };
        for namespace in &record.namespaces {
            if self.storage.namespace_references(namespace, hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Counters for one successful session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Remote entries that became current locally
    pub entries_received: usize,
    /// Local entries shipped to the peer
    pub entries_sent: usize,
    /// Blobs downloaded from the peer
    pub blobs_fetched: usize,
    /// Blobs uploaded to the peer
    pub blobs_sent: usize,
    /// The peer does not hold the namespace
    pub unknown_namespace: bool,
}

/// Outcome of a session with one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReport {
    pub node: NodeId,
    /// Counters on success, the error message otherwise
    pub result: Result<PeerStats, String>,
}

impl PeerReport {
    /// The session completed and the peer served the namespace
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(stats) if !stats.unknown_namespace)
    }

    /// The session completed but the peer does not hold the namespace
    pub fn is_not_holding(&self) -> bool {
        matches!(&self.result, Ok(stats) if stats.unknown_namespace)
    }
}

/// Outcome of one sync round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub namespace: NamespaceId,
    pub peers: Vec<PeerReport>,
}

impl SyncReport {
    pub fn new(namespace: NamespaceId) -> Self {
        Self {
            namespace,
            peers: Vec::new(),
        }
    }

    /// Number of peers that served the namespace
    pub fn succeeded(&self) -> usize {
        self.peers.iter().filter(|p| p.is_success()).count()
    }

    /// Number of peers that answered without holding the namespace
    pub fn not_holding(&self) -> usize {
        self.peers.iter().filter(|p| p.is_not_holding()).count()
    }

    /// Number of peers the round failed with
    pub fn failed(&self) -> usize {
        self.peers.iter().filter(|p| p.result.is_err()).count()
    }

    /// Entries adopted from all peers
    pub fn entries_received(&self) -> usize {
        self.peers
            .iter()
            .filter_map(|p| p.result.as_ref().ok())
            .map(|s| s.entries_received)
            .sum()
    }

    /// Blobs downloaded from all peers
    pub fn blobs_fetched(&self) -> usize {
        self.peers
            .iter()
            .filter_map(|p| p.result.as_ref().ok())
            .map(|s| s.blobs_fetched)
            .sum()
    }

    /// The report itself if at least one peer served the namespace.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NetworkUnreachable` when there were no peers, or
    /// every peer either failed or no longer holds the namespace.
    pub fn into_result(self) -> SyncResult<SyncReport> {
        if self.peers.is_empty() {
            return Err(SyncError::NetworkUnreachable(format!(
                "No known nodes for namespace {}",
                self.namespace.fmt_short()
            )));
        }
        if self.succeeded() == 0 {
            let reasons: Vec<String> = self
                .peers
                .iter()
                .map(|p| match &p.result {
                    Err(e) => format!("{}: {}", p.node.fmt_short(), e),
                    Ok(_) => format!("{}: does not hold the namespace", p.node.fmt_short()),
                })
                .collect();
            return Err(SyncError::NetworkUnreachable(format!(
                "No node reachable for namespace {} ({})",
                self.namespace.fmt_short(),
                reasons.join("; ")
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::identity::Author;
    use crate::nodes::NodeSource;
    use crate::storage::NamespaceOrigin;
    use crate::types::NodeAddr;
    use tempfile::TempDir;

    fn ns() -> NamespaceId {
        NamespaceId::from_bytes([3; 32])
    }

    #[test]
    fn test_empty_report_is_unreachable() {
        let err = SyncReport::new(ns()).into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);
    }

    #[test]
    fn test_all_failed_is_unreachable() {
        let mut report = SyncReport::new(ns());
        report.peers.push(PeerReport {
            node: NodeId::from_bytes([1; 32]),
            result: Err("connection refused".into()),
        });
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_unknown_namespace_is_not_a_success() {
        let mut report = SyncReport::new(ns());
        report.peers.push(PeerReport {
            node: NodeId::from_bytes([1; 32]),
            result: Ok(PeerStats {
                unknown_namespace: true,
                ..Default::default()
            }),
        });
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.not_holding(), 1);
        assert_eq!(report.failed(), 0);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);
        assert!(err.to_string().contains("does not hold the namespace"));
    }

    #[test]
    fn test_partial_success_is_ok() {
        let mut report = SyncReport::new(ns());
        report.peers.push(PeerReport {
            node: NodeId::from_bytes([1; 32]),
            result: Err("timeout".into()),
        });
        report.peers.push(PeerReport {
            node: NodeId::from_bytes([2; 32]),
            result: Ok(PeerStats {
                entries_received: 2,
                blobs_fetched: 1,
                ..Default::default()
            }),
        });

        let report = report.into_result().unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.entries_received(), 2);
        assert_eq!(report.blobs_fetched(), 1);
    }

    #[tokio::test]
    async fn test_blobs_served_only_for_tagged_namespaces() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("test.redb")).unwrap();
        let blobs = BlobStore::memory();
        let nodes = NodeDirectory::new(storage.db_handle()).unwrap();
        let replicas = Arc::new(Replicas::new(storage.clone(), blobs.clone(), Author::generate().unwrap()));
        let ctx = SyncContext::new(replicas.clone(), nodes.clone(), blobs, storage, SyncOptions::default());

        let shared = NamespaceId::generate().unwrap();
        let private = NamespaceId::generate().unwrap();
        let (r, _) = replicas.ensure(shared, NamespaceOrigin::Created).unwrap();
        let shared_hash = r.write("a.txt", b"shared".to_vec()).await.unwrap();
        let (r, _) = replicas.ensure(private, NamespaceOrigin::Created).unwrap();
        let private_hash = r.write("b.txt", b"private".to_vec()).await.unwrap();

        let peer = NodeId::from_bytes([4; 32]);
        let stranger = NodeId::from_bytes([5; 32]);
        nodes.upsert(&NodeAddr::new(peer), NodeSource::Inbound, Some(shared)).unwrap();
        nodes.upsert(&NodeAddr::new(stranger), NodeSource::Inbound, None).unwrap();

        assert!(ctx.may_serve_blob(&peer, &shared_hash).unwrap());
        assert!(!ctx.may_serve_blob(&peer, &private_hash).unwrap());
        assert!(!ctx.may_serve_blob(&stranger, &shared_hash).unwrap());
        assert!(!ctx.may_serve_blob(&NodeId::from_bytes([6; 32]), &shared_hash).unwrap());
    }
}
