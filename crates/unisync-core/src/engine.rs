//! Main Engine - the handle integrators own
//!
//! Engine coordinates Storage, BlobStore, Replicas and the sync transport for:
//! - Namespaces of files, one replica each
//! - Content-addressed file contents
//! - Tickets for onboarding peers
//! - P2P synchronization, on demand or in the background
//!
//! # Example
//!
//! ```ignore
//! use unisync_core::Engine;
//!
//! let engine = Engine::open("~/.unisync/data").await?;
//!
//! // Write a file into the default namespace
//! let ns = engine.get_or_create_namespace().await?;
//! engine.write_file(ns, "notes/todo.txt", "buy milk").await?;
//!
//! // Share it
//! let ticket = engine.share(ns).await?;
//! println!("{}", ticket);
//!
//! // On another device
//! let ns = other.import(&ticket).await?;
//! let bytes = other.read_file(ns, "notes/todo.txt").await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iroh::SecretKey;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::config::{EngineOptions, TransportConfig};
use crate::error::{ErrorKind, ResultExt, SyncError, SyncResult};
use crate::identity::Author;
use crate::nodes::{NodeDirectory, NodeRecord, NodeSource, ReconnectSummary};
use crate::replica::{Replica, Replicas};
use crate::storage::{NamespaceOrigin, NamespaceRecord, Storage};
use crate::sync::{
    session, InboundHandler, IrohTransport, SharedTransport, SyncContext, SyncHandler, SyncReport,
};
use crate::ticket::DocTicket;
use crate::types::{AuthorId, Entry, Hash, NamespaceId, NodeAddr, NodeId};

/// Database file under the data directory
const DB_FILE: &str = "unisync.redb";
/// Blob directory under the data directory
const BLOBS_DIR: &str = "blobs";

type ReportMap = Arc<Mutex<HashMap<NamespaceId, SyncReport>>>;

/// Main entry point for UniSync
///
/// Engine manages:
/// - Persistent storage of namespaces, entries and known nodes
/// - One replica per namespace
/// - The sync transport and background listeners
///
/// One engine per data directory; the database refuses a second open.
pub struct Engine {
    data_dir: PathBuf,
    storage: Storage,
    blobs: BlobStore,
    author: Author,
    nodes: NodeDirectory,
    replicas: Arc<Replicas>,
    ctx: Arc<SyncContext>,
    transport: SharedTransport,
    listen_interval: Duration,
    /// Root of every background task's cancellation
    cancel: CancellationToken,
    tasks: TaskTracker,
    listeners: Mutex<HashMap<NamespaceId, CancellationToken>>,
    reports: ReportMap,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .field("node_id", &self.transport.node_id())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open an engine on the iroh transport with default options.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the data directory cannot be used.
    pub async fn open(data_dir: impl AsRef<Path>) -> SyncResult<Self> {
        Self::open_with(data_dir, EngineOptions::default()).await
    }

    /// Open an engine with explicit options.
    ///
    /// This will:
    /// - Create the data directory if it doesn't exist
    /// - Open the database and the iroh-blobs store
    /// - Load or create the author key and the endpoint key
    /// - Bind the transport and start serving inbound sessions
    pub async fn open_with(data_dir: impl AsRef<Path>, options: EngineOptions) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "Opening engine");

        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(SyncError::from)
            .context(format!("Cannot use data directory {}", data_dir.display()))?;

        let storage = Storage::new(data_dir.join(DB_FILE))?;
        let blobs = BlobStore::persistent(&data_dir.join(BLOBS_DIR)).await?;
        let author = Author::load_or_create(&storage)?;
        let nodes = NodeDirectory::new(storage.db_handle())?;
        let replicas = Arc::new(Replicas::new(storage.clone(), blobs.clone(), author.clone()));
        let ctx = Arc::new(SyncContext::new(
            replicas.clone(),
            nodes.clone(),
            blobs.clone(),
            storage.clone(),
            options.sync_options(),
        ));

        let handler: Arc<dyn InboundHandler> = Arc::new(SyncHandler::new(ctx.clone()));
        let secret = storage.load_or_create_secret(Storage::ENDPOINT_SECRET_KEY)?;
        let transport: SharedTransport = match options.transport {
            TransportConfig::Iroh(ref iroh) => {
                Arc::new(IrohTransport::bind(secret, iroh, handler, blobs.clone()).await?)
            }
            TransportConfig::Memory(ref network) => {
                let node_id = NodeId::from(SecretKey::from_bytes(&secret).public());
                Arc::new(network.bind(node_id, handler, blobs.clone()))
            }
        };

        info!(
            author = %author.id().fmt_short(),
            node_id = %transport.node_id().fmt_short(),
            "Engine ready"
        );

        Ok(Self {
            data_dir,
            storage,
            blobs,
            author,
            nodes,
            replicas,
            ctx,
            transport,
            listen_interval: options.listen_interval,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            listeners: Mutex::new(HashMap::new()),
            reports: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed("Engine is shut down".into()));
        }
        Ok(())
    }

    fn replica(&self, namespace: NamespaceId) -> SyncResult<Arc<Replica>> {
        self.ensure_open()?;
        self.replicas.get(&namespace)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════

    /// This device's author id, stable across restarts
    pub fn author(&self) -> SyncResult<AuthorId> {
        self.ensure_open()?;
        Ok(self.author.id())
    }

    /// This node's transport identity, stable across restarts
    pub fn node_id(&self) -> NodeId {
        self.transport.node_id()
    }

    /// This node's current address
    pub fn node_addr(&self) -> NodeAddr {
        self.transport.node_addr()
    }

    /// Summary of this engine
    pub async fn info(&self) -> SyncResult<EngineInfo> {
        self.ensure_open()?;
        Ok(EngineInfo {
            data_dir: self.data_dir.clone(),
            author: self.author.id(),
            node: self.transport.node_addr(),
            namespaces: self.storage.list_namespaces()?.len(),
            known_nodes: self.nodes.known_nodes()?.len(),
            blobs: self.blobs.count().await?,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Namespaces
    // ═══════════════════════════════════════════════════════════════════════

    /// The earliest namespace on this device, created if there is none
    pub async fn get_or_create_namespace(&self) -> SyncResult<NamespaceId> {
        self.ensure_open()?;
        match self.storage.list_namespaces()?.first() {
            Some(record) => Ok(record.id),
            None => self.create_namespace().await,
        }
    }

    /// Create a fresh namespace
    pub async fn create_namespace(&self) -> SyncResult<NamespaceId> {
        self.ensure_open()?;
        let namespace = NamespaceId::generate()?;
        self.replicas.ensure(namespace, NamespaceOrigin::Created)?;
        Ok(namespace)
    }

    /// All namespaces on this device, oldest first
    pub fn list_namespaces(&self) -> SyncResult<Vec<NamespaceRecord>> {
        self.ensure_open()?;
        self.storage.list_namespaces()
    }

    /// Remove a namespace and all of its entries.
    ///
    /// Its blobs stay on disk until the next [`Engine::gc`].
    pub async fn delete_namespace(&self, namespace: NamespaceId) -> SyncResult<()> {
        self.ensure_open()?;
        self.unlisten(namespace);
        self.replicas.close(&namespace).await;
        if !self.storage.delete_namespace(&namespace)? {
            return Err(SyncError::NamespaceNotFound(namespace.to_string()));
        }
        self.nodes.untag_namespace(&namespace)?;
        self.reports.lock().remove(&namespace);
        info!(namespace = %namespace.fmt_short(), "Deleted namespace");
        Ok(())
    }

    /// Stop listening and close the namespace's replica handle.
    ///
    /// The next operation on the namespace reopens it from disk.
    pub async fn close_namespace(&self, namespace: NamespaceId) -> SyncResult<()> {
        self.ensure_open()?;
        self.unlisten(namespace);
        self.replicas.close(&namespace).await;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Files
    // ═══════════════════════════════════════════════════════════════════════

    /// Write `data` at `path`, returning the content hash
    pub async fn write_file(
        &self,
        namespace: NamespaceId,
        path: &str,
        data: impl Into<Bytes>,
    ) -> SyncResult<Hash> {
        self.replica(namespace)?.write(path, data).await
    }

    /// Stream a local file into `path`
    pub async fn write_file_from(
        &self,
        namespace: NamespaceId,
        path: &str,
        source: impl AsRef<Path>,
    ) -> SyncResult<Hash> {
        self.replica(namespace)?.write_from(path, source.as_ref()).await
    }

    /// Delete `path`, returning the tombstone hash
    pub async fn delete_file(&self, namespace: NamespaceId, path: &str) -> SyncResult<Hash> {
        self.replica(namespace)?.delete(path).await
    }

    /// Content of the live file at `path`
    pub async fn read_file(&self, namespace: NamespaceId, path: &str) -> SyncResult<Bytes> {
        self.replica(namespace)?.read(path).await
    }

    /// Current entry at `path`, tombstones included
    pub fn get_entry(&self, namespace: NamespaceId, path: &str) -> SyncResult<Option<Entry>> {
        self.replica(namespace)?.get(path)
    }

    /// Content of a blob by hash
    pub async fn read_file_hash(&self, hash: &Hash) -> SyncResult<Bytes> {
        self.ensure_open()?;
        self.blobs.get(hash).await
    }

    /// Current entries, one per path, sorted by path
    pub fn list_files(&self, namespace: NamespaceId, include_deleted: bool) -> SyncResult<Vec<Entry>> {
        self.replica(namespace)?.list(include_deleted)
    }

    /// Copy the live file at `path` to `dest`
    pub async fn export_file(
        &self,
        namespace: NamespaceId,
        path: &str,
        dest: impl AsRef<Path>,
    ) -> SyncResult<u64> {
        self.replica(namespace)?.export(path, dest.as_ref()).await
    }

    /// Copy a blob to `dest`
    pub async fn export_hash(&self, hash: &Hash, dest: impl AsRef<Path>) -> SyncResult<u64> {
        self.ensure_open()?;
        self.blobs.export(hash, dest).await
    }

    /// Delete blobs no stored entry refers to. Returns how many were removed.
    ///
    /// Run it while no writes are in flight: a write stores its blob before
    /// its entry.
    pub async fn gc(&self) -> SyncResult<usize> {
        self.ensure_open()?;
        let mut live: HashSet<Hash> = self.storage.referenced_hashes()?.into_iter().collect();
        live.insert(Hash::empty());
        let removed = self.blobs.retain(&live).await?;
        info!(removed, "Collected unreferenced blobs");
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tickets
    // ═══════════════════════════════════════════════════════════════════════

    /// Ticket for `namespace`: this node plus other nodes known to hold it
    pub async fn share(&self, namespace: NamespaceId) -> SyncResult<DocTicket> {
        self.replica(namespace)?;
        let local = self.transport.node_addr();
        let mut nodes = vec![local.clone()];
        nodes.extend(
            self.nodes
                .list()?
                .into_iter()
                .filter(|r| r.holds(&namespace) && r.node_id() != local.node_id)
                .map(|r| r.addr),
        );
        debug!(namespace = %namespace.fmt_short(), nodes = nodes.len(), "Created ticket");
        Ok(DocTicket::new(namespace, nodes))
    }

    /// Join the namespace of `ticket` and run a first sync.
    ///
    /// Importing the same ticket again is harmless. A failed first sync is
    /// logged and kept as the namespace's last report; it is not an error.
    pub async fn import(&self, ticket: &DocTicket) -> SyncResult<NamespaceId> {
        self.ensure_open()?;
        let namespace = ticket.namespace;
        let local = self.transport.node_id();

        for node in ticket.nodes.iter().filter(|n| n.node_id != local) {
            self.nodes.upsert(node, NodeSource::Ticket, Some(namespace))?;
            if let Err(e) = self.transport.add_node_addr(node) {
                warn!(peer = %node.node_id.fmt_short(), error = %e, "Ignoring unusable node address");
            }
        }

        let (_, created) = self.replicas.ensure(namespace, NamespaceOrigin::Imported)?;
        info!(namespace = %namespace.fmt_short(), created, "Imported ticket");

        match self.sync(namespace).await {
            Ok(report) => debug!(
                namespace = %namespace.fmt_short(),
                received = report.entries_received(),
                "First sync finished"
            ),
            Err(e) if e.kind() == ErrorKind::Closed => return Err(e),
            Err(e) => warn!(namespace = %namespace.fmt_short(), error = %e, "First sync failed"),
        }
        Ok(namespace)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one sync round for `namespace` against every target node.
    ///
    /// # Errors
    ///
    /// Returns `NetworkUnreachable` if no node could be synced with, and
    /// `Closed` if the engine shuts down meanwhile. The report is kept either
    /// way and available from [`Engine::last_sync_report`].
    pub async fn sync(&self, namespace: NamespaceId) -> SyncResult<SyncReport> {
        self.replica(namespace)?;
        let report = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(SyncError::Closed("Engine shut down during sync".into()));
            }
            report = session::sync_round(&self.ctx, self.transport.as_ref(), namespace) => report?,
        };
        self.reports.lock().insert(namespace, report.clone());
        report.into_result()
    }

    /// Report of the latest finished round for `namespace`
    pub fn last_sync_report(&self, namespace: NamespaceId) -> Option<SyncReport> {
        self.reports.lock().get(&namespace).cloned()
    }

    /// Keep `namespace` in sync in the background.
    ///
    /// Returns immediately. Rounds repeat every listen interval until
    /// [`Engine::unlisten`], [`Engine::close_namespace`] or
    /// [`Engine::shutdown`]. Listening twice is a no-op.
    pub fn listen(&self, namespace: NamespaceId) -> SyncResult<()> {
        self.replica(namespace)?;

        let token = {
            let mut listeners = self.listeners.lock();
            if listeners.get(&namespace).is_some_and(|t| !t.is_cancelled()) {
                return Ok(());
            }
            let token = self.cancel.child_token();
            listeners.insert(namespace, token.clone());
            token
        };

        let ctx = self.ctx.clone();
        let transport = self.transport.clone();
        let reports = self.reports.clone();
        let interval = self.listen_interval;

        self.tasks.spawn(async move {
            info!(namespace = %namespace.fmt_short(), ?interval, "Listening");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = session::sync_round(&ctx, transport.as_ref(), namespace) => match result {
                        Ok(report) => {
                            reports.lock().insert(namespace, report);
                        }
                        Err(e) if e.is_not_found() => {
                            warn!(namespace = %namespace.fmt_short(), "Namespace gone, stopping listener");
                            break;
                        }
                        Err(e) => warn!(namespace = %namespace.fmt_short(), error = %e, "Sync round failed"),
                    },
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(namespace = %namespace.fmt_short(), "Listener stopped");
        });
        Ok(())
    }

    /// Stop the background listener of `namespace`. Returns `true` if one ran.
    pub fn unlisten(&self, namespace: NamespaceId) -> bool {
        match self.listeners.lock().remove(&namespace) {
            Some(token) => {
                token.cancel();
                debug!(namespace = %namespace.fmt_short(), "Stopped listening");
                true
            }
            None => false,
        }
    }

    /// Whether a background listener runs for `namespace`
    pub fn is_listening(&self, namespace: NamespaceId) -> bool {
        self.listeners
            .lock()
            .get(&namespace)
            .is_some_and(|t| !t.is_cancelled())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Nodes
    // ═══════════════════════════════════════════════════════════════════════

    /// Ids of every known node
    pub fn known_nodes(&self) -> SyncResult<Vec<NodeId>> {
        self.ensure_open()?;
        self.nodes.known_nodes()
    }

    /// Records of every known node
    pub fn nodes(&self) -> SyncResult<Vec<NodeRecord>> {
        self.ensure_open()?;
        self.nodes.list()
    }

    /// Record of one node
    pub fn node_info(&self, id: &NodeId) -> SyncResult<Option<NodeRecord>> {
        self.ensure_open()?;
        self.nodes.get(id)
    }

    /// Forget a node. Returns `true` if it was known.
    pub fn remove_node(&self, id: &NodeId) -> SyncResult<bool> {
        self.ensure_open()?;
        let removed = self.nodes.remove(id)?;
        if removed {
            info!(peer = %id.fmt_short(), "Removed node");
        }
        Ok(removed)
    }

    /// Probe every known node and refresh its status.
    ///
    /// Unreachable nodes are reported, not raised.
    pub async fn reconnect(&self) -> SyncResult<ReconnectSummary> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(SyncError::Closed("Engine shut down during reconnect".into()))
            }
            summary = session::reconnect(&self.ctx, self.transport.as_ref()) => summary,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether [`Engine::shutdown`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Gracefully shut the engine down.
    ///
    /// Cancels listeners and in-flight syncs, stops the transport so no peer
    /// session can reach a replica any more, waits for background tasks, then
    /// closes every replica and the blob store. Every later call fails with
    /// `Closed`.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Closed("Engine is already shut down".into()));
        }
        info!("Shutting down engine");

        self.listeners.lock().clear();
        self.cancel.cancel();

        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "Failed to shut transport down cleanly");
        }

        self.tasks.close();
        self.tasks.wait().await;

        self.replicas.close_all().await;
        if let Err(e) = self.blobs.shutdown().await {
            warn!(error = %e, "Failed to shut blob store down cleanly");
        }

        info!("Engine shutdown complete");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Information about this engine
#[derive(Debug, Clone)]
pub struct EngineInfo {
    /// Directory where data is stored
    pub data_dir: PathBuf,
    pub author: AuthorId,
    /// This node's current address
    pub node: NodeAddr,
    /// Number of namespaces
    pub namespaces: usize,
    /// Number of known nodes
    pub known_nodes: usize,
    /// Number of stored blobs
    pub blobs: usize,
}
