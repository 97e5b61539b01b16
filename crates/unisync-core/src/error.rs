//! Error types for UniSync

use thiserror::Error;

/// Coarse classification of failures, stable across releases.
///
/// Bindings map these onto their native error idiom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing hash, entry, namespace or node
    NotFound,
    /// Disk or storage-root failure
    Io,
    /// No peer could be reached
    NetworkUnreachable,
    /// Malformed or version-incompatible ticket
    InvalidTicket,
    /// Engine or namespace already shut down
    Closed,
    /// A peer sent something we could not accept
    Protocol,
    /// Invalid caller input
    InvalidInput,
    /// Serialization or database faults
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Io => "io error",
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::InvalidTicket => "invalid ticket",
            ErrorKind::Closed => "closed",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Main error type for UniSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Namespace does not exist locally
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// No live entry for the path
    #[error("Entry not found: namespace {namespace}, path {path}")]
    EntryNotFound { namespace: String, path: String },

    /// Blob is not present in the local store
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// The blob store failed
    #[error("Blob error: {0}")]
    Blob(String),

    /// Node is not in the directory
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network-related error talking to a single peer
    #[error("Network error: {0}")]
    Network(String),

    /// No peer could be reached for the operation
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Invalid ticket format or data
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    /// Peer violated the sync protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Caller supplied an unusable value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine or replica has been shut down
    #[error("Closed: {0}")]
    Closed(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error with additional context
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NamespaceNotFound(_)
            | SyncError::EntryNotFound { .. }
            | SyncError::BlobNotFound(_)
            | SyncError::NodeNotFound(_) => ErrorKind::NotFound,
            SyncError::Io(_) | SyncError::Blob(_) => ErrorKind::Io,
            SyncError::Network(_) | SyncError::NetworkUnreachable(_) => {
                ErrorKind::NetworkUnreachable
            }
            SyncError::InvalidTicket(_) => ErrorKind::InvalidTicket,
            SyncError::Closed(_) => ErrorKind::Closed,
            SyncError::Protocol(_) | SyncError::SignatureInvalid(_) => ErrorKind::Protocol,
            SyncError::InvalidInput(_) => ErrorKind::InvalidInput,
            SyncError::Storage(_)
            | SyncError::Database(_)
            | SyncError::Transaction(_)
            | SyncError::Table(_)
            | SyncError::StorageOp(_)
            | SyncError::Commit(_)
            | SyncError::Serialization(_)
            | SyncError::Internal(_) => ErrorKind::Internal,
            SyncError::Context { source, .. } => source.kind(),
        }
    }

    /// Wrap this error with a context message, keeping its kind
    pub fn context(self, context: impl Into<String>) -> Self {
        SyncError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Attach context to fallible results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> SyncResult<T>;

    fn with_context<F, S>(self, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<SyncError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> SyncResult<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::NamespaceNotFound("abc".to_string());
        assert_eq!(format!("{}", err), "Namespace not found: abc");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
        assert_eq!(sync_err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = SyncError::BlobNotFound("deadbeef".to_string())
            .context("reading a.txt")
            .context("export");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "export: reading a.txt: Blob not found: deadbeef"
        );
    }

    #[test]
    fn test_result_ext_context() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::other("disk full"));
        let err = res.context("writing blob").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().starts_with("writing blob"));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SyncError::InvalidTicket("x".into()).kind(),
            ErrorKind::InvalidTicket
        );
        assert_eq!(SyncError::Closed("x".into()).kind(), ErrorKind::Closed);
        assert_eq!(
            SyncError::NetworkUnreachable("x".into()).kind(),
            ErrorKind::NetworkUnreachable
        );
        assert_eq!(
            SyncError::SignatureInvalid("x".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(SyncError::Blob("x".into()).kind(), ErrorKind::Io);
    }
}
