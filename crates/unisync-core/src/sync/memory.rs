//! In-process transport
//!
//! Every node bound to the same [`MemoryNetwork`] can reach every other one
//! through `tokio::io::duplex` pipes. Blob fetches copy between the nodes'
//! blob stores, subject to the serving node's [`InboundHandler::may_fetch`].
//! Nodes can be taken offline to simulate unreachable peers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::transport::{BlobFetcher, InboundHandler, PeerStream, Transport};
use crate::blobs::BlobStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{Hash, NodeAddr, NodeId};

/// Buffer size of each direction of a pipe
const PIPE_CAPACITY: usize = 256 * 1024;

struct NodeSlot {
    handler: Arc<dyn InboundHandler>,
    blobs: BlobStore,
    addr: NodeAddr,
    online: bool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// A shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<NodeId, NodeSlot>>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.nodes.lock().len())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node whose inbound sessions go to `handler` and whose blobs
    /// live in `blobs`.
    ///
    /// A node already bound under the same id is replaced and its sessions
    /// are cancelled.
    pub fn bind(&self, node_id: NodeId, handler: Arc<dyn InboundHandler>, blobs: BlobStore) -> MemoryTransport {
        let slot = NodeSlot {
            handler,
            blobs,
            addr: NodeAddr::new(node_id),
            online: true,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        };
        if let Some(old) = self.nodes.lock().insert(node_id, slot) {
            old.cancel.cancel();
            old.tracker.close();
        }
        debug!(node = %node_id.fmt_short(), "Bound memory transport");

        MemoryTransport {
            network: self.clone(),
            node_id,
        }
    }

    /// Take a node on or off the network. Returns `false` if it is not bound.
    pub fn set_online(&self, node_id: &NodeId, online: bool) -> bool {
        match self.nodes.lock().get_mut(node_id) {
            Some(slot) => {
                slot.online = online;
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, node_id: &NodeId) -> bool {
        self.nodes.lock().get(node_id).is_some_and(|s| s.online)
    }

    /// Ids of every bound node
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    node_id: NodeId,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn offline(&self) -> SyncError {
        SyncError::Network(format!("Local node {} is offline", self.node_id.fmt_short()))
    }
}

fn unreachable(node: &NodeId) -> SyncError {
    SyncError::Network(format!("Node {} is offline", node.fmt_short()))
}

#[async_trait]
impl BlobFetcher for MemoryTransport {
    async fn fetch_blob(&self, from: &NodeAddr, hash: &Hash) -> SyncResult<bool> {
        let (local, source, handler) = {
            let nodes = self.network.nodes.lock();
            let local = nodes
                .get(&self.node_id)
                .filter(|s| s.online)
                .ok_or_else(|| self.offline())?;
            let source = nodes
                .get(&from.node_id)
                .filter(|s| s.online)
                .ok_or_else(|| unreachable(&from.node_id))?;
            (local.blobs.clone(), source.blobs.clone(), source.handler.clone())
        };

        if !handler.may_fetch(&self.node_id, hash) || !source.has(hash).await? {
            debug!(peer = %from.node_id.fmt_short(), hash = %hash.fmt_short(), "Blob not provided");
            return Ok(false);
        }
        let data = source.get(hash).await?;
        let stored = local.put(data).await?;
        if stored != *hash {
            return Err(SyncError::Protocol(format!(
                "Blob {} arrived with hash {}",
                hash.fmt_short(),
                stored.fmt_short()
            )));
        }
        debug!(peer = %from.node_id.fmt_short(), hash = %hash.fmt_short(), "Fetched blob");
        Ok(true)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn node_addr(&self) -> NodeAddr {
        NodeAddr::new(self.node_id)
    }

    fn add_node_addr(&self, _addr: &NodeAddr) -> SyncResult<()> {
        Ok(())
    }

    async fn connect(&self, addr: &NodeAddr) -> SyncResult<PeerStream> {
        let (handler, target_addr, tracker, cancel) = {
            let nodes = self.network.nodes.lock();
            if !nodes.get(&self.node_id).is_some_and(|s| s.online) {
                return Err(self.offline());
            }
            let target = nodes.get(&addr.node_id).ok_or_else(|| {
                SyncError::Network(format!("No route to node {}", addr.node_id.fmt_short()))
            })?;
            if !target.online {
                return Err(unreachable(&addr.node_id));
            }
            (
                target.handler.clone(),
                target.addr.clone(),
                target.tracker.clone(),
                target.cancel.clone(),
            )
        };

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let remote = self.node_id;
        // The serving node pulls pushed blobs with its own identity
        let fetcher = MemoryTransport {
            network: self.network.clone(),
            node_id: addr.node_id,
        };
        tracker.spawn(async move {
            let peer = PeerStream {
                remote,
                stream: Box::new(theirs),
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = handler.handle(peer, target_addr, &fetcher) => {
                    if let Err(e) = result {
                        debug!(peer = %remote.fmt_short(), error = %e, "Memory session ended with error");
                    }
                }
            }
        });

        Ok(PeerStream {
            remote: addr.node_id,
            stream: Box::new(ours),
        })
    }

    async fn shutdown(&self) -> SyncResult<()> {
        let slot = self.network.nodes.lock().remove(&self.node_id);
        if let Some(slot) = slot {
            slot.cancel.cancel();
            slot.tracker.close();
            slot.tracker.wait().await;
        }
        debug!(node = %self.node_id.fmt_short(), "Memory transport shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echoes everything back, prefixed with the remote id's first byte.
    /// Serves blobs only to the node with id byte 2.
    struct Echo;

    #[async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, mut peer: PeerStream, _local: NodeAddr, _fetcher: &dyn BlobFetcher) -> SyncResult<()> {
            let mut buf = [0u8; 5];
            peer.stream.read_exact(&mut buf).await?;
            peer.stream.write_all(&[peer.remote.as_bytes()[0]]).await?;
            peer.stream.write_all(&buf).await?;
            peer.stream.shutdown().await?;
            Ok(())
        }

        fn may_fetch(&self, peer: &NodeId, _hash: &Hash) -> bool {
            *peer == id(2)
        }
    }

    /// Holds every session open until it is cancelled
    struct Stall {
        dropped: Arc<std::sync::atomic::AtomicBool>,
    }

    struct SetOnDrop(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl InboundHandler for Stall {
        async fn handle(&self, _peer: PeerStream, _local: NodeAddr, _fetcher: &dyn BlobFetcher) -> SyncResult<()> {
            let _guard = SetOnDrop(self.dropped.clone());
            std::future::pending::<()>().await;
            Ok(())
        }

        fn may_fetch(&self, _peer: &NodeId, _hash: &Hash) -> bool {
            false
        }
    }

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    fn bind(net: &MemoryNetwork, b: u8) -> MemoryTransport {
        net.bind(id(b), Arc::new(Echo), BlobStore::memory())
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let net = MemoryNetwork::new();
        let a = bind(&net, 1);
        let _b = bind(&net, 2);

        let mut peer = a.connect(&NodeAddr::new(id(2))).await.unwrap();
        assert_eq!(peer.remote, id(2));
        peer.stream.write_all(b"hello").await.unwrap();

        let mut reply = Vec::new();
        peer.stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"\x01hello");
    }

    #[tokio::test]
    async fn test_offline_node_unreachable() {
        let net = MemoryNetwork::new();
        let a = bind(&net, 1);
        let _b = bind(&net, 2);

        assert!(net.set_online(&id(2), false));
        let err = a.connect(&NodeAddr::new(id(2))).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));

        net.set_online(&id(2), true);
        assert!(a.connect(&NodeAddr::new(id(2))).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_node_unreachable() {
        let net = MemoryNetwork::new();
        let a = bind(&net, 1);
        assert!(a.connect(&NodeAddr::new(id(9))).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_unbinds() {
        let net = MemoryNetwork::new();
        let a = bind(&net, 1);
        let b = bind(&net, 2);

        b.shutdown().await.unwrap();
        assert_eq!(net.node_ids(), vec![id(1)]);
        assert!(a.connect(&NodeAddr::new(id(2))).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_blob_copies_between_stores() {
        let net = MemoryNetwork::new();
        let owner_blobs = BlobStore::memory();
        let _owner = net.bind(id(1), Arc::new(Echo), owner_blobs.clone());
        let reader_blobs = BlobStore::memory();
        let reader = net.bind(id(2), Arc::new(Echo), reader_blobs.clone());

        let hash = owner_blobs.put(b"shared content".to_vec()).await.unwrap();
        assert!(reader.fetch_blob(&NodeAddr::new(id(1)), &hash).await.unwrap());
        assert_eq!(reader_blobs.get(&hash).await.unwrap(), &b"shared content"[..]);

        // Absent on the owner
        let absent = Hash::new(b"absent");
        assert!(!reader.fetch_blob(&NodeAddr::new(id(1)), &absent).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_blob_refused_by_owner() {
        let net = MemoryNetwork::new();
        let owner_blobs = BlobStore::memory();
        let _owner = net.bind(id(1), Arc::new(Echo), owner_blobs.clone());
        let stranger_blobs = BlobStore::memory();
        let stranger = net.bind(id(3), Arc::new(Echo), stranger_blobs.clone());

        let hash = owner_blobs.put(b"not for you".to_vec()).await.unwrap();
        assert!(!stranger.fetch_blob(&NodeAddr::new(id(1)), &hash).await.unwrap());
        assert!(!stranger_blobs.has(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_blob_from_offline_node_fails() {
        let net = MemoryNetwork::new();
        let _a = bind(&net, 1);
        let b = bind(&net, 2);

        net.set_online(&id(1), false);
        let err = b.fetch_blob(&NodeAddr::new(id(1)), &Hash::new(b"x")).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }

    #[tokio::test]
    async fn test_shutdown_ends_inbound_sessions_first() {
        let net = MemoryNetwork::new();
        let a = bind(&net, 1);
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let b = net.bind(
            id(2),
            Arc::new(Stall {
                dropped: dropped.clone(),
            }),
            BlobStore::memory(),
        );

        let _session = a.connect(&NodeAddr::new(id(2))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));

        b.shutdown().await.unwrap();
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
