//! Transport abstraction for sync sessions.
//!
//! The sync protocol needs a few things from the network: dial a node,
//! accept inbound sessions, exchange bytes over one bidirectional stream and
//! pull blobs from a node that holds them. Everything below that (QUIC,
//! relays, hole punching, verified blob streaming) belongs to the transport
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SyncResult;
use crate::types::{Hash, NodeAddr, NodeId};

/// Byte stream carrying one sync session
pub trait SyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed session stream
pub type BoxedStream = Box<dyn SyncStream>;

/// An established session with an authenticated remote node
pub struct PeerStream {
    /// Identity of the other side, as authenticated by the transport
    pub remote: NodeId,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Downloads blobs from remote nodes into the local blob store
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Fetch `hash` from `from` and store it locally.
    ///
    /// Returns `false` when the node did not provide the blob, because it
    /// lacks it or refused the request. Content is verified against `hash`
    /// before it is stored.
    async fn fetch_blob(&self, from: &NodeAddr, hash: &Hash) -> SyncResult<bool>;
}

/// Serves sessions opened by remote nodes.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Run one inbound session to completion.
    ///
    /// `local` is this node's current address, for the handshake reply.
    /// `fetcher` pulls blobs the peer pushes entries for.
    async fn handle(&self, peer: PeerStream, local: NodeAddr, fetcher: &dyn BlobFetcher) -> SyncResult<()>;

    /// Whether `peer` may download `hash` from this node
    fn may_fetch(&self, peer: &NodeId, hash: &Hash) -> bool;
}

/// Network substrate used by the sync engine.
///
/// Implementations deliver inbound sessions to the [`InboundHandler`] they
/// were constructed with, and serve local blobs to the peers it allows.
#[async_trait]
pub trait Transport: BlobFetcher + Send + Sync + 'static {
    /// Stable identity of this node
    fn node_id(&self) -> NodeId;

    /// This node's currently known address
    fn node_addr(&self) -> NodeAddr;

    /// Make address hints for a remote node available for dialing
    fn add_node_addr(&self, addr: &NodeAddr) -> SyncResult<()>;

    /// Open a session with `addr`
    async fn connect(&self, addr: &NodeAddr) -> SyncResult<PeerStream>;

    /// Stop accepting sessions and release network resources
    async fn shutdown(&self) -> SyncResult<()>;
}

/// Shared transport handle
pub type SharedTransport = Arc<dyn Transport>;
