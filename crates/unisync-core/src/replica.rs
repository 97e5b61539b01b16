//! Namespace replicas
//!
//! A [`Replica`] is this device's copy of one namespace: the current entry for
//! every path, chosen by a last-writer-wins rule with a deterministic
//! tie-break, backed by the `entries` table.
//!
//! ## Merge rule
//!
//! Entries for the same path are ordered by `(timestamp, hash bytes)`, with
//! author bytes as the final tie-break. The strictly greatest entry is
//! current. Tombstones take part in the same order, so a later write revives
//! a deleted path and a later delete hides an earlier write. Because the
//! order is total, replicas that have seen the same set of entries agree on
//! every current entry, whatever order the entries arrived in.
//!
//! ## Concurrency
//!
//! Mutations (local writes, deletes, merges) are serialized by a per-replica
//! async mutex. Reads clone from an in-memory snapshot behind a
//! `parking_lot::RwLock` and never wait for a mutation that is doing I/O.
//! Callers never hold the mutex across network I/O: sync sessions collect
//! remote entries first and merge them afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::error::{SyncError, SyncResult};
use crate::identity::Author;
use crate::storage::{ApplyOutcome, NamespaceOrigin, NamespaceRecord, NamespaceState, Storage};
use crate::types::{now_nanos, Entry, EntryHead, Hash, NamespaceId, SignedEntry};

/// Lifecycle of a replica handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Record written, initial setup in progress
    Creating,
    /// Serving reads, writes and sync
    Active,
    /// Waiting for in-flight mutations before closing
    ShuttingDown,
    /// Terminal; every operation fails with `Closed`
    Closed,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Creating => write!(f, "creating"),
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::ShuttingDown => write!(f, "shutting down"),
            ReplicaState::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of merging a batch of remote entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries that became current for their path
    pub applied: usize,
    /// Entries that lost to what we already had
    pub stale: usize,
    /// Entries dropped for a bad signature or foreign namespace
    pub rejected: usize,
    /// Content of newly adopted entries that is not stored locally
    pub missing_blobs: Vec<Hash>,
}

/// Differences between a peer's heads and our current entries
#[derive(Debug, Clone, Default)]
pub struct Delta {
    /// Our entries the peer does not have or that beat the peer's
    pub entries: Vec<SignedEntry>,
    /// Paths where the peer has something newer than we do
    pub wanted: Vec<String>,
}

/// Per-replica write clock
struct WriteClock {
    last_issued: u64,
}

/// One device's copy of a namespace.
pub struct Replica {
    namespace: NamespaceId,
    storage: Storage,
    blobs: BlobStore,
    author: Author,
    writer: tokio::sync::Mutex<WriteClock>,
    current: RwLock<BTreeMap<String, SignedEntry>>,
    state: RwLock<ReplicaState>,
    syncing: AtomicUsize,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("namespace", &self.namespace)
            .field("state", &*self.state.read())
            .field("paths", &self.current.read().len())
            .finish()
    }
}

/// Marks a replica as syncing while alive
pub struct SyncGuard<'a> {
    replica: &'a Replica,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.replica.syncing.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Replica {
    /// Load a replica from storage.
    ///
    /// A record left in `Creating` by a crash is promoted to `Active`.
    pub(crate) fn load(
        record: &NamespaceRecord,
        storage: Storage,
        blobs: BlobStore,
        author: Author,
    ) -> SyncResult<Self> {
        let namespace = record.id;
        let stored = storage.load_entries(&namespace)?;

        let mut current: BTreeMap<String, SignedEntry> = BTreeMap::new();
        let mut last_issued = 0u64;
        let local_author = author.id();
        for signed in stored {
            if signed.entry.author == local_author {
                last_issued = last_issued.max(signed.entry.timestamp);
            }
            install(&mut current, signed);
        }

        if record.state == NamespaceState::Creating {
            info!(namespace = %namespace.fmt_short(), "Promoting namespace left in creating state");
            storage.set_namespace_state(&namespace, NamespaceState::Active)?;
        }

        debug!(
            namespace = %namespace.fmt_short(),
            paths = current.len(),
            "Loaded replica"
        );

        Ok(Self {
            namespace,
            storage,
            blobs,
            author,
            writer: tokio::sync::Mutex::new(WriteClock { last_issued }),
            current: RwLock::new(current),
            state: RwLock::new(ReplicaState::Active),
            syncing: AtomicUsize::new(0),
        })
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.read()
    }

    /// Whether at least one sync session is running against this replica
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst) > 0
    }

    fn ensure_active(&self) -> SyncResult<()> {
        match *self.state.read() {
            ReplicaState::Active | ReplicaState::Creating => Ok(()),
            state => Err(SyncError::Closed(format!(
                "Namespace {} is {}",
                self.namespace.fmt_short(),
                state
            ))),
        }
    }

    /// Mark the replica as syncing for the guard's lifetime
    pub fn begin_sync(&self) -> SyncResult<SyncGuard<'_>> {
        self.ensure_active()?;
        self.syncing.fetch_add(1, Ordering::SeqCst);
        Ok(SyncGuard { replica: self })
    }

    fn next_timestamp(&self, clock: &mut WriteClock, path: &str) -> u64 {
        let current_ts = self
            .current
            .read()
            .get(path)
            .map(|c| c.entry.timestamp.saturating_add(1))
            .unwrap_or(0);
        let ts = now_nanos()
            .max(clock.last_issued.saturating_add(1))
            .max(current_ts);
        clock.last_issued = ts;
        ts
    }

    /// Hash of the current entry at `path` that a new entry would displace,
    /// when no other current path still references it
    fn displaced_hash(&self, path: &str, replacement: &Hash) -> Option<Hash> {
        let current = self.current.read();
        let displaced = current.get(path)?.entry.hash;
        if displaced == *replacement {
            return None;
        }
        let shared = current
            .iter()
            .any(|(other, signed)| other != path && signed.entry.hash == displaced);
        (!shared).then_some(displaced)
    }

    /// Sign and persist a local entry, then make it current
    fn commit_local(&self, entry: Entry) -> SyncResult<SignedEntry> {
        let signed = self.author.sign(entry)?;
        let release = self.displaced_hash(signed.path(), &signed.entry.hash);
        self.storage.store_entry(&signed, false, release.as_ref())?;
        install(&mut self.current.write(), signed.clone());
        Ok(signed)
    }

    /// Write `data` at `path`, returning the content hash
    pub async fn write(&self, path: &str, data: impl Into<Bytes>) -> SyncResult<Hash> {
        self.ensure_active()?;
        validate_path(path)?;
        let data: Bytes = data.into();
        let length = data.len() as u64;
        let hash = self.blobs.put(data).await?;

        let mut clock = self.writer.lock().await;
        self.ensure_active()?;
        let timestamp = self.next_timestamp(&mut clock, path);
        let entry = Entry::new(self.namespace, path, self.author.id(), timestamp, hash, length);
        self.commit_local(entry)?;

        debug!(namespace = %self.namespace.fmt_short(), path, hash = %hash.fmt_short(), length, "Wrote file");
        Ok(hash)
    }

    /// Stream a file from disk into `path`, returning the content hash
    pub async fn write_from(&self, path: &str, source: &Path) -> SyncResult<Hash> {
        self.ensure_active()?;
        validate_path(path)?;
        let (hash, length) = self.blobs.put_file(source).await?;

        let mut clock = self.writer.lock().await;
        self.ensure_active()?;
        let timestamp = self.next_timestamp(&mut clock, path);
        let entry = Entry::new(self.namespace, path, self.author.id(), timestamp, hash, length);
        self.commit_local(entry)?;

        debug!(namespace = %self.namespace.fmt_short(), path, source = %source.display(), length, "Imported file");
        Ok(hash)
    }

    /// Delete `path`, returning the tombstone hash.
    ///
    /// Fails with `NotFound` when the path has no live entry.
    pub async fn delete(&self, path: &str) -> SyncResult<Hash> {
        self.ensure_active()?;
        let empty = self.blobs.put(Bytes::new()).await?;

        let mut clock = self.writer.lock().await;
        self.ensure_active()?;
        if self.live_entry(path).is_none() {
            return Err(self.not_found(path));
        }
        let timestamp = self.next_timestamp(&mut clock, path);
        let entry = Entry::tombstone(self.namespace, path, self.author.id(), timestamp);
        self.commit_local(entry)?;

        debug!(namespace = %self.namespace.fmt_short(), path, "Deleted file");
        Ok(empty)
    }

    fn not_found(&self, path: &str) -> SyncError {
        SyncError::EntryNotFound {
            namespace: self.namespace.to_string(),
            path: path.to_string(),
        }
    }

    fn live_entry(&self, path: &str) -> Option<Entry> {
        self.current
            .read()
            .get(path)
            .filter(|c| !c.entry.is_tombstone())
            .map(|c| c.entry.clone())
    }

    /// Current entry for `path`, tombstones included
    pub fn get(&self, path: &str) -> SyncResult<Option<Entry>> {
        self.ensure_active()?;
        Ok(self.current.read().get(path).map(|c| c.entry.clone()))
    }

    /// Read the content of the live entry at `path`.
    ///
    /// Fails with `NotFound` when the path is absent, deleted, or its content
    /// has not been fetched yet.
    pub async fn read(&self, path: &str) -> SyncResult<Bytes> {
        self.ensure_active()?;
        let entry = self.live_entry(path).ok_or_else(|| self.not_found(path))?;
        self.blobs.get(&entry.hash).await
    }

    /// Copy the content at `path` to `dest`
    pub async fn export(&self, path: &str, dest: &Path) -> SyncResult<u64> {
        self.ensure_active()?;
        let entry = self.live_entry(path).ok_or_else(|| self.not_found(path))?;
        self.blobs.export(&entry.hash, dest).await
    }

    /// Current entries sorted by path
    pub fn list(&self, include_deleted: bool) -> SyncResult<Vec<Entry>> {
        self.ensure_active()?;
        Ok(self
            .current
            .read()
            .values()
            .filter(|c| include_deleted || !c.entry.is_tombstone())
            .map(|c| c.entry.clone())
            .collect())
    }

    /// Heads of all current entries, for offering to a peer
    pub fn heads(&self) -> SyncResult<Vec<EntryHead>> {
        self.ensure_active()?;
        Ok(self
            .current
            .read()
            .values()
            .map(|c| EntryHead::from(&c.entry))
            .collect())
    }

    /// Current signed entries for the given paths
    pub fn entries_for(&self, paths: &[String]) -> SyncResult<Vec<SignedEntry>> {
        self.ensure_active()?;
        let current = self.current.read();
        Ok(paths
            .iter()
            .filter_map(|p| current.get(p).cloned())
            .collect())
    }

    /// Compare a peer's heads against our current entries
    pub fn delta(&self, heads: &[EntryHead]) -> SyncResult<Delta> {
        self.ensure_active()?;
        let theirs: HashMap<&str, &EntryHead> =
            heads.iter().map(|h| (h.path.as_str(), h)).collect();
        let current = self.current.read();

        let mut delta = Delta::default();
        for (path, ours) in current.iter() {
            match theirs.get(path.as_str()) {
                Some(head) if head.merge_cmp_entry(&ours.entry).is_ge() => {}
                _ => delta.entries.push(ours.clone()),
            }
        }
        for head in heads {
            match current.get(&head.path) {
                Some(ours) if head.merge_cmp_entry(&ours.entry).is_le() => {}
                _ => delta.wanted.push(head.path.clone()),
            }
        }
        Ok(delta)
    }

    /// Merge remote entries.
    ///
    /// Each entry is verified and applied on its own: installing it and
    /// recording its missing blob commit together or not at all.
    pub async fn merge(&self, entries: Vec<SignedEntry>) -> SyncResult<MergeReport> {
        self.ensure_active()?;
        let mut report = MergeReport::default();
        if entries.is_empty() {
            return Ok(report);
        }

        let _clock = self.writer.lock().await;
        self.ensure_active()?;

        for signed in entries {
            if signed.entry.namespace != self.namespace {
                warn!(
                    namespace = %self.namespace.fmt_short(),
                    foreign = %signed.entry.namespace.fmt_short(),
                    "Rejecting entry for another namespace"
                );
                report.rejected += 1;
                continue;
            }
            if let Err(e) = signed.verify() {
                warn!(namespace = %self.namespace.fmt_short(), path = signed.path(), error = %e, "Rejecting entry");
                report.rejected += 1;
                continue;
            }

            let adopt = self
                .current
                .read()
                .get(signed.path())
                .map_or(true, |c| signed.entry.supersedes(&c.entry));

            let missing = if signed.entry.is_tombstone() {
                self.blobs.put(Bytes::new()).await?;
                false
            } else {
                adopt && !self.blobs.has(&signed.entry.hash).await?
            };

            let release = if adopt {
                self.displaced_hash(signed.path(), &signed.entry.hash)
            } else {
                None
            };
            let outcome = self.storage.store_entry(&signed, missing, release.as_ref())?;
            if adopt && outcome == ApplyOutcome::Stored {
                if missing {
                    report.missing_blobs.push(signed.entry.hash);
                }
                install(&mut self.current.write(), signed);
                report.applied += 1;
            } else {
                report.stale += 1;
            }
        }

        report.missing_blobs.sort();
        report.missing_blobs.dedup();
        if report.applied > 0 || report.rejected > 0 {
            debug!(
                namespace = %self.namespace.fmt_short(),
                applied = report.applied,
                stale = report.stale,
                rejected = report.rejected,
                missing = report.missing_blobs.len(),
                "Merged remote entries"
            );
        }
        Ok(report)
    }

    /// Blobs referenced by adopted entries that are still missing
    pub fn pending_blobs(&self) -> SyncResult<Vec<(Hash, u64)>> {
        self.storage.pending_blobs(&self.namespace)
    }

    /// Close the handle after in-flight mutations finish.
    ///
    /// Persisted state is untouched; the namespace can be reopened.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == ReplicaState::Closed {
                return;
            }
            *state = ReplicaState::ShuttingDown;
        }
        let _clock = self.writer.lock().await;
        *self.state.write() = ReplicaState::Closed;
        debug!(namespace = %self.namespace.fmt_short(), "Closed replica");
    }
}

/// Install `signed` if it beats the current entry for its path
fn install(current: &mut BTreeMap<String, SignedEntry>, signed: SignedEntry) {
    match current.get(signed.path()) {
        Some(existing) if !signed.entry.supersedes(&existing.entry) => {}
        _ => {
            current.insert(signed.entry.path.clone(), signed);
        }
    }
}

fn validate_path(path: &str) -> SyncResult<()> {
    if path.is_empty() {
        return Err(SyncError::InvalidInput("Path must not be empty".into()));
    }
    if path.contains('\0') {
        return Err(SyncError::InvalidInput("Path must not contain NUL".into()));
    }
    Ok(())
}

/// Open replica handles of one storage root.
///
/// Hands out one shared handle per namespace and reopens closed handles from
/// disk on the next lookup.
pub struct Replicas {
    storage: Storage,
    blobs: BlobStore,
    author: Author,
    open: Mutex<HashMap<NamespaceId, Arc<Replica>>>,
}

impl std::fmt::Debug for Replicas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicas")
            .field("open", &self.open.lock().len())
            .finish_non_exhaustive()
    }
}

impl Replicas {
    pub fn new(storage: Storage, blobs: BlobStore, author: Author) -> Self {
        Self {
            storage,
            blobs,
            author,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Open handle for `namespace`, `None` if it does not exist locally
    pub fn find(&self, namespace: &NamespaceId) -> SyncResult<Option<Arc<Replica>>> {
        let mut open = self.open.lock();
        if let Some(replica) = open.get(namespace) {
            if replica.state() != ReplicaState::Closed {
                return Ok(Some(replica.clone()));
            }
        }

        let Some(record) = self.storage.load_namespace(namespace)? else {
            open.remove(namespace);
            return Ok(None);
        };
        let replica = Arc::new(Replica::load(
            &record,
            self.storage.clone(),
            self.blobs.clone(),
            self.author.clone(),
        )?);
        open.insert(*namespace, replica.clone());
        Ok(Some(replica))
    }

    /// Open handle for `namespace`, failing with `NotFound` if absent
    pub fn get(&self, namespace: &NamespaceId) -> SyncResult<Arc<Replica>> {
        self.find(namespace)?
            .ok_or_else(|| SyncError::NamespaceNotFound(namespace.to_string()))
    }

    /// Create `namespace` locally if needed.
    ///
    /// Returns the handle and whether it was newly created.
    pub fn ensure(
        &self,
        namespace: NamespaceId,
        origin: NamespaceOrigin,
    ) -> SyncResult<(Arc<Replica>, bool)> {
        if let Some(replica) = self.find(&namespace)? {
            return Ok((replica, false));
        }

        let record = NamespaceRecord::new(namespace, now_nanos(), origin);
        self.storage.save_namespace(&record)?;
        let replica = self.get(&namespace)?;
        info!(namespace = %namespace.fmt_short(), ?origin, "Created namespace");
        Ok((replica, true))
    }

    /// Close the handle of `namespace` if one is open
    pub async fn close(&self, namespace: &NamespaceId) {
        let replica = self.open.lock().remove(namespace);
        if let Some(replica) = replica {
            replica.close().await;
        }
    }

    /// Close every open handle
    pub async fn close_all(&self) {
        let replicas: Vec<_> = self.open.lock().drain().map(|(_, r)| r).collect();
        for replica in replicas {
            replica.close().await;
        }
    }
}
