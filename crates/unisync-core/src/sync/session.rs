//! Outbound sync sessions
//!
//! The client side of the protocol. A session is opened per peer and per
//! round; nothing is kept open between rounds. Blob content moves outside the
//! session stream, through [`Transport::fetch_blob`].

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::protocol::{unexpected, FramedStream, Message};
use super::transport::Transport;
use super::{PeerReport, PeerStats, SyncContext, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::nodes::{ConnectionOutcome, NodeSource, ReconnectSummary};
use crate::replica::Replica;
use crate::types::{NamespaceId, NodeAddr, NodeId};

/// Dial `target` and complete the Hello/Welcome handshake.
async fn open_session(
    ctx: &SyncContext,
    transport: &dyn Transport,
    target: &NodeAddr,
) -> SyncResult<FramedStream> {
    transport.add_node_addr(target)?;

    let handshake = async {
        let peer = transport.connect(target).await?;
        if peer.remote != target.node_id {
            return Err(SyncError::Protocol(format!(
                "Dialed {} but reached {}",
                target.node_id.fmt_short(),
                peer.remote.fmt_short()
            )));
        }

        let mut framed = FramedStream::new(
            peer.stream,
            ctx.options.max_frame_len,
            ctx.options.io_timeout,
        );
        framed
            .send(&Message::Hello {
                node: transport.node_addr(),
            })
            .await?;

        match framed.expect().await? {
            Message::Welcome { node } if node.node_id == target.node_id => {
                ctx.nodes.upsert(&node, NodeSource::Outbound, None)?;
            }
            Message::Welcome { node } => {
                return Err(SyncError::Protocol(format!(
                    "Peer {} introduced itself as {}",
                    target.node_id.fmt_short(),
                    node.node_id.fmt_short()
                )))
            }
            other => return Err(unexpected(&other, "Welcome")),
        }
        Ok::<FramedStream, SyncError>(framed)
    };

    match tokio::time::timeout(ctx.options.connect_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Network(format!(
            "Connecting to {} timed out after {:?}",
            target.node_id.fmt_short(),
            ctx.options.connect_timeout
        ))),
    }
}

/// Run one sync session for `replica` with `target`.
pub async fn sync_with_peer(
    ctx: &SyncContext,
    transport: &dyn Transport,
    replica: &Replica,
    target: &NodeAddr,
) -> SyncResult<PeerStats> {
    let _syncing = replica.begin_sync()?;
    let namespace = replica.namespace();
    let mut framed = open_session(ctx, transport, target).await?;
    let mut stats = PeerStats::default();

    framed
        .send(&Message::Offer {
            namespace,
            heads: replica.heads()?,
        })
        .await?;

    match framed.expect().await? {
        Message::Delta { entries, wanted } => {
            // Tagged before pushing, so the peer may fetch the pushed blobs
            ctx.nodes.tag_namespace(&target.node_id, namespace)?;
            let merged = replica.merge(entries).await?;
            stats.entries_received = merged.applied;

            if !wanted.is_empty() {
                let entries = replica.entries_for(&wanted)?;
                stats.entries_sent = entries.len();
                framed.send(&Message::Push { namespace, entries }).await?;

                match framed.expect().await? {
                    Message::Applied { fetched } => stats.blobs_sent = fetched.len(),
                    other => return Err(unexpected(&other, "Applied")),
                }
            }
        }
        Message::UnknownNamespace { .. } => {
            debug!(
                peer = %target.node_id.fmt_short(),
                namespace = %namespace.fmt_short(),
                "Peer does not hold namespace"
            );
            stats.unknown_namespace = true;
        }
        other => return Err(unexpected(&other, "Delta")),
    }

    framed.finish().await?;

    if !stats.unknown_namespace {
        stats.blobs_fetched = fetch_pending(ctx, transport, replica, target).await?;
    }
    Ok(stats)
}

/// Download the replica's pending blobs from `target`.
///
/// Blobs the peer cannot provide stay pending for a later round.
async fn fetch_pending(
    ctx: &SyncContext,
    transport: &dyn Transport,
    replica: &Replica,
    target: &NodeAddr,
) -> SyncResult<usize> {
    let mut fetched = 0;
    for (hash, length) in replica.pending_blobs()? {
        if ctx.blobs.has(&hash).await? {
            ctx.storage.resolve_pending_blob(&hash)?;
            continue;
        }
        if transport.fetch_blob(target, &hash).await? {
            ctx.storage.resolve_pending_blob(&hash)?;
            fetched += 1;
        } else {
            debug!(
                peer = %target.node_id.fmt_short(),
                hash = %hash.fmt_short(),
                length,
                "Blob still pending"
            );
        }
    }
    Ok(fetched)
}

/// Check that `target` answers.
pub async fn probe(ctx: &SyncContext, transport: &dyn Transport, target: &NodeAddr) -> SyncResult<()> {
    let mut framed = open_session(ctx, transport, target).await?;
    framed.send(&Message::Ping).await?;
    match framed.expect().await? {
        Message::Pong => {}
        other => return Err(unexpected(&other, "Pong")),
    }
    framed.finish().await
}

fn record_outcome(ctx: &SyncContext, node: &NodeId, ok: bool) {
    let outcome = if ok {
        ConnectionOutcome::Success
    } else {
        ConnectionOutcome::Failure
    };
    if let Err(e) = ctx.nodes.record_connection(node, outcome) {
        warn!(peer = %node.fmt_short(), error = %e, "Failed to record connection outcome");
    }
}

/// Sync `namespace` with every target node concurrently.
///
/// Per-peer failures are reported, never raised; the caller decides what a
/// round without any success means.
pub async fn sync_round(
    ctx: &SyncContext,
    transport: &dyn Transport,
    namespace: NamespaceId,
) -> SyncResult<SyncReport> {
    let replica = ctx.replicas.get(&namespace)?;
    let local = transport.node_id();
    let targets: Vec<NodeAddr> = ctx
        .nodes
        .sync_targets(&namespace)?
        .into_iter()
        .map(|record| record.addr)
        .filter(|addr| addr.node_id != local)
        .collect();

    debug!(
        namespace = %namespace.fmt_short(),
        peers = targets.len(),
        "Starting sync round"
    );

    let sessions = targets.iter().map(|target| {
        let replica = &replica;
        async move {
            let node = target.node_id;
            let session = sync_with_peer(ctx, transport, replica, target);
            let result = match tokio::time::timeout(ctx.options.peer_timeout, session).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Network(format!(
                    "Session timed out after {:?}",
                    ctx.options.peer_timeout
                ))),
            };
            record_outcome(ctx, &node, result.is_ok());

            match &result {
                Ok(stats) => debug!(
                    peer = %node.fmt_short(),
                    received = stats.entries_received,
                    sent = stats.entries_sent,
                    fetched = stats.blobs_fetched,
                    "Synced with peer"
                ),
                Err(e) => warn!(peer = %node.fmt_short(), error = %e, "Sync with peer failed"),
            }
            PeerReport {
                node,
                result: result.map_err(|e| e.to_string()),
            }
        }
    });

    let mut report = SyncReport::new(namespace);
    report.peers = join_all(sessions).await;

    info!(
        namespace = %namespace.fmt_short(),
        succeeded = report.succeeded(),
        not_holding = report.not_holding(),
        failed = report.failed(),
        received = report.entries_received(),
        "Sync round finished"
    );
    Ok(report)
}

/// Probe every known node and update its status.
pub async fn reconnect(ctx: &SyncContext, transport: &dyn Transport) -> SyncResult<ReconnectSummary> {
    let local = transport.node_id();
    let targets: Vec<NodeAddr> = ctx
        .nodes
        .list()?
        .into_iter()
        .map(|record| record.addr)
        .filter(|addr| addr.node_id != local)
        .collect();

    let probes = targets.iter().map(|target| async move {
        let result = match tokio::time::timeout(ctx.options.peer_timeout, probe(ctx, transport, target)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Network("Probe timed out".into())),
        };
        record_outcome(ctx, &target.node_id, result.is_ok());
        (target.node_id, result)
    });

    let mut summary = ReconnectSummary {
        attempted: targets.len(),
        ..Default::default()
    };
    for (node, result) in join_all(probes).await {
        match result {
            Ok(()) => summary.reachable.push(node),
            Err(e) => {
                debug!(peer = %node.fmt_short(), error = %e, "Node unreachable");
                summary.unreachable.push((node, e.to_string()));
            }
        }
    }

    info!(
        attempted = summary.attempted,
        reachable = summary.reachable.len(),
        "Reconnect finished"
    );
    Ok(summary)
}
