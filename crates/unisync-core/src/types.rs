//! Core types for UniSync

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// BLAKE3 digest identifying a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Hash a complete in-memory payload
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }

    /// Hash of the empty payload, used by tombstones
    pub fn empty() -> Self {
        Self::new([])
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log output
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl From<blake3::Hash> for Hash {
    fn from(value: blake3::Hash) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<iroh_blobs::Hash> for Hash {
    fn from(value: iroh_blobs::Hash) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<Hash> for iroh_blobs::Hash {
    fn from(value: Hash) -> Self {
        iroh_blobs::Hash::from_bytes(value.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.fmt_short())
    }
}

impl FromStr for Hash {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| SyncError::InvalidInput(format!("Invalid hash hex: {}", e)))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SyncError::InvalidInput(format!(
                "Invalid hash length: expected 32 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

/// Decode a base58 string into exactly 32 bytes
fn decode_base58_32(s: &str, what: &str) -> Result<[u8; 32], SyncError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| SyncError::InvalidInput(format!("Invalid {} '{}': {}", what, s, e)))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        SyncError::InvalidInput(format!(
            "Invalid {}: expected 32 bytes, got {}",
            what,
            v.len()
        ))
    })
}

/// Identifier of a synchronized collection of files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId([u8; 32]);

impl NamespaceId {
    /// Create a new random namespace id
    pub fn generate() -> Result<Self, SyncError> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| SyncError::Internal(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn fmt_short(&self) -> String {
        bs58::encode(&self.0[..6]).into_string()
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceId({})", self.fmt_short())
    }
}

impl FromStr for NamespaceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_base58_32(s, "namespace id").map(Self)
    }
}

/// Public identity of an author (ed25519 verifying key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuthorId([u8; 32]);

impl AuthorId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn fmt_short(&self) -> String {
        bs58::encode(&self.0[..6]).into_string()
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self.fmt_short())
    }
}

impl FromStr for AuthorId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_base58_32(s, "author id").map(Self)
    }
}

/// Network identity of a node (the transport's public key).
///
/// Rendered as hex, the same way iroh renders endpoint ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl From<iroh::PublicKey> for NodeId {
    fn from(value: iroh::PublicKey) -> Self {
        Self(*value.as_bytes())
    }
}

impl TryFrom<NodeId> for iroh::PublicKey {
    type Error = SyncError;

    fn try_from(value: NodeId) -> Result<Self, Self::Error> {
        iroh::PublicKey::from_bytes(&value.0)
            .map_err(|e| SyncError::InvalidInput(format!("Invalid node id: {}", e)))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.fmt_short())
    }
}

impl FromStr for NodeId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| SyncError::InvalidInput(format!("Invalid node id hex: {}", e)))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SyncError::InvalidInput(format!(
                "Node id must be 32 bytes (got {})",
                v.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

/// Address hints for reaching a node.
///
/// Addresses are kept as strings so records written by one transport can be
/// read back without depending on its address types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub node_id: NodeId,
    pub relay_url: Option<String>,
    pub direct_addresses: Vec<String>,
}

impl NodeAddr {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            relay_url: None,
            direct_addresses: Vec::new(),
        }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self
    }

    pub fn with_direct_addresses(
        mut self,
        addrs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        for addr in addrs {
            let addr = addr.into();
            if !self.direct_addresses.contains(&addr) {
                self.direct_addresses.push(addr);
            }
        }
        self
    }

    /// Fold newer hints from `other` into this address.
    ///
    /// A relay URL from `other` replaces ours; direct addresses are unioned.
    /// Returns whether anything changed.
    pub fn merge(&mut self, other: &NodeAddr) -> bool {
        let mut changed = false;
        if other.relay_url.is_some() && other.relay_url != self.relay_url {
            self.relay_url = other.relay_url.clone();
            changed = true;
        }
        for addr in &other.direct_addresses {
            if !self.direct_addresses.contains(addr) {
                self.direct_addresses.push(addr.clone());
                changed = true;
            }
        }
        changed
    }

    /// Whether there is anything to dial besides the node id
    pub fn has_hints(&self) -> bool {
        self.relay_url.is_some() || !self.direct_addresses.is_empty()
    }
}

/// Current wall clock in nanoseconds since the Unix epoch
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// The state of one path in a namespace, as written by one author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Namespace this entry belongs to
    pub namespace: NamespaceId,
    /// File path (the entry key within the namespace)
    pub path: String,
    /// Author who produced the entry
    pub author: AuthorId,
    /// Nanoseconds since the Unix epoch
    pub timestamp: u64,
    /// Content hash (the empty hash for tombstones)
    pub hash: Hash,
    /// Content length in bytes
    pub length: u64,
    /// Whether this entry marks the path as deleted
    pub deleted: bool,
}

impl Entry {
    /// Create an entry for live content
    pub fn new(
        namespace: NamespaceId,
        path: impl Into<String>,
        author: AuthorId,
        timestamp: u64,
        hash: Hash,
        length: u64,
    ) -> Self {
        Self {
            namespace,
            path: path.into(),
            author,
            timestamp,
            hash,
            length,
            deleted: false,
        }
    }

    /// Create a tombstone for `path`
    pub fn tombstone(
        namespace: NamespaceId,
        path: impl Into<String>,
        author: AuthorId,
        timestamp: u64,
    ) -> Self {
        Self {
            namespace,
            path: path.into(),
            author,
            timestamp,
            hash: Hash::empty(),
            length: 0,
            deleted: true,
        }
    }

    /// Canonical bytes covered by the author's signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, SyncError> {
        postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode entry: {}", e)))
    }

    /// Total order used by the merge rule.
    ///
    /// Timestamp first, then hash bytes. Author bytes only separate entries
    /// that agree on both, which keeps the order total.
    pub fn merge_cmp(&self, other: &Entry) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.hash.as_bytes().cmp(other.hash.as_bytes()))
            .then_with(|| self.author.as_bytes().cmp(other.author.as_bytes()))
    }

    /// Whether this entry wins over `other` for the same path
    pub fn supersedes(&self, other: &Entry) -> bool {
        self.merge_cmp(other) == Ordering::Greater
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// An entry together with its author's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub entry: Entry,
    pub signature: ed25519_dalek::Signature,
}

impl SignedEntry {
    /// Verify that the signature was produced by `entry.author`
    pub fn verify(&self) -> Result<(), SyncError> {
        use ed25519_dalek::{Verifier, VerifyingKey};

        let key = VerifyingKey::from_bytes(self.entry.author.as_bytes())
            .map_err(|e| SyncError::SignatureInvalid(format!("Invalid author key: {}", e)))?;
        let message = self.entry.signing_bytes()?;
        key.verify(&message, &self.signature).map_err(|_| {
            SyncError::SignatureInvalid(format!(
                "Entry '{}' is not signed by author {}",
                self.entry.path,
                self.entry.author.fmt_short()
            ))
        })
    }

    pub fn path(&self) -> &str {
        &self.entry.path
    }
}

/// Compact description of an entry used during delta exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHead {
    pub path: String,
    pub author: AuthorId,
    pub timestamp: u64,
    pub hash: Hash,
}

impl From<&Entry> for EntryHead {
    fn from(entry: &Entry) -> Self {
        Self {
            path: entry.path.clone(),
            author: entry.author,
            timestamp: entry.timestamp,
            hash: entry.hash,
        }
    }
}

impl EntryHead {
    /// Same ordering as [`Entry::merge_cmp`], restricted to head fields
    pub fn merge_cmp_entry(&self, entry: &Entry) -> Ordering {
        self.timestamp
            .cmp(&entry.timestamp)
            .then_with(|| self.hash.as_bytes().cmp(entry.hash.as_bytes()))
            .then_with(|| self.author.as_bytes().cmp(entry.author.as_bytes()))
    }
}
