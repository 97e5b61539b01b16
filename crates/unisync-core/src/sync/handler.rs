//! Inbound sync sessions
//!
//! Serves Offer, Push and Ping requests from remote nodes for as long as the
//! engine is open, and decides which blobs a remote node may download.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::protocol::{FramedStream, Message};
use super::transport::{BlobFetcher, InboundHandler, PeerStream};
use super::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::nodes::{ConnectionOutcome, NodeSource};
use crate::types::{Hash, NodeAddr, NodeId};

/// Handler for sessions opened by remote nodes
#[derive(Debug, Clone)]
pub struct SyncHandler {
    ctx: Arc<SyncContext>,
}

impl SyncHandler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    async fn refuse(framed: &mut FramedStream, message: String) -> SyncError {
        // Best effort; the peer may already be gone.
        let _ = framed
            .send(&Message::Error {
                message: message.clone(),
            })
            .await;
        let _ = framed.close().await;
        SyncError::Protocol(message)
    }

    async fn handshake(
        &self,
        framed: &mut FramedStream,
        remote: NodeId,
        local: NodeAddr,
    ) -> SyncResult<NodeAddr> {
        let node = match framed.expect().await? {
            Message::Hello { node } => node,
            other => {
                let msg = format!("Expected Hello, got {}", other.name());
                return Err(Self::refuse(framed, msg).await);
            }
        };
        if node.node_id != remote {
            let msg = format!(
                "Hello from {} claims to be {}",
                remote.fmt_short(),
                node.node_id.fmt_short()
            );
            return Err(Self::refuse(framed, msg).await);
        }

        self.ctx.nodes.upsert(&node, NodeSource::Inbound, None)?;
        self.ctx
            .nodes
            .record_connection(&remote, ConnectionOutcome::Success)?;
        framed.send(&Message::Welcome { node: local }).await?;
        Ok(node)
    }

    /// Download the blobs a push left missing from the pushing node
    async fn fetch_pushed(&self, fetcher: &dyn BlobFetcher, from: &NodeAddr, missing: &[Hash]) -> Vec<Hash> {
        let mut fetched = Vec::new();
        for hash in missing {
            match fetcher.fetch_blob(from, hash).await {
                Ok(true) => match self.ctx.storage.resolve_pending_blob(hash) {
                    Ok(()) => fetched.push(*hash),
                    Err(e) => warn!(hash = %hash.fmt_short(), error = %e, "Failed to resolve pending blob"),
                },
                Ok(false) => {
                    debug!(peer = %from.node_id.fmt_short(), hash = %hash.fmt_short(), "Pushing node did not provide blob")
                }
                Err(e) => {
                    warn!(peer = %from.node_id.fmt_short(), hash = %hash.fmt_short(), error = %e, "Failed to fetch pushed blob")
                }
            }
        }
        fetched
    }

    async fn serve(&self, framed: &mut FramedStream, peer: &NodeAddr, fetcher: &dyn BlobFetcher) -> SyncResult<()> {
        let ctx = &self.ctx;
        let remote = peer.node_id;

        loop {
            let Some(msg) = framed.recv().await? else {
                debug!(peer = %remote.fmt_short(), "Peer closed session without Bye");
                return Ok(());
            };

            match msg {
                Message::Offer { namespace, heads } => match ctx.replicas.find(&namespace)? {
                    Some(replica) => {
                        let delta = replica.delta(&heads)?;
                        ctx.nodes.tag_namespace(&remote, namespace)?;
                        debug!(
                            peer = %remote.fmt_short(),
                            namespace = %namespace.fmt_short(),
                            sending = delta.entries.len(),
                            wanted = delta.wanted.len(),
                            "Answering offer"
                        );
                        framed
                            .send(&Message::Delta {
                                entries: delta.entries,
                                wanted: delta.wanted,
                            })
                            .await?;
                    }
                    None => {
                        framed.send(&Message::UnknownNamespace { namespace }).await?;
                    }
                },
                Message::Push { namespace, entries } => {
                    let Some(replica) = ctx.replicas.find(&namespace)? else {
                        let msg = format!("Push for unknown namespace {}", namespace.fmt_short());
                        return Err(Self::refuse(framed, msg).await);
                    };
                    let report = replica.merge(entries).await?;
                    let fetched = self.fetch_pushed(fetcher, peer, &report.missing_blobs).await;
                    debug!(
                        peer = %remote.fmt_short(),
                        namespace = %namespace.fmt_short(),
                        applied = report.applied,
                        fetched = fetched.len(),
                        missing = report.missing_blobs.len(),
                        "Applied push"
                    );
                    framed.send(&Message::Applied { fetched }).await?;
                }
                Message::Ping => framed.send(&Message::Pong).await?,
                Message::Bye => return Ok(()),
                other => {
                    let msg = format!("Unexpected {} message", other.name());
                    return Err(Self::refuse(framed, msg).await);
                }
            }
        }
    }
}

#[async_trait]
impl InboundHandler for SyncHandler {
    async fn handle(&self, peer: PeerStream, local: NodeAddr, fetcher: &dyn BlobFetcher) -> SyncResult<()> {
        let remote = peer.remote;
        let mut framed = FramedStream::new(
            peer.stream,
            self.ctx.options.max_frame_len,
            self.ctx.options.io_timeout,
        );

        let result = match self.handshake(&mut framed, remote, local).await {
            Ok(node) => self.serve(&mut framed, &node, fetcher).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                framed.close().await?;
                debug!(peer = %remote.fmt_short(), "Inbound session finished");
            }
            Err(e) => warn!(peer = %remote.fmt_short(), error = %e, "Inbound session failed"),
        }
        result
    }

    fn may_fetch(&self, peer: &NodeId, hash: &Hash) -> bool {
        match self.ctx.may_serve_blob(peer, hash) {
            Ok(true) => true,
            Ok(false) => {
                debug!(peer = %peer.fmt_short(), hash = %hash.fmt_short(), "Refusing blob outside shared namespaces");
                false
            }
            Err(e) => {
                warn!(peer = %peer.fmt_short(), error = %e, "Failed to check blob access");
                false
            }
        }
    }
}
