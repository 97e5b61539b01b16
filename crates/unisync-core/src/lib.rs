//! UniSync Core Library
//!
//! A peer-to-peer synchronized file store, embedded per device.
//!
//! ## Overview
//!
//! Every device keeps a local replica of one or more namespaces (named
//! collections of files). Replicas converge by exchanging signed entries and
//! content-addressed blobs directly with each other, over iroh QUIC
//! connections, without a central server.
//!
//! ## Core Principles
//!
//! - **Local-first**: reads and writes never wait for the network
//! - **Deterministic merge**: last writer wins by `(timestamp, hash, author)`
//! - **Content addressing**: file contents are stored once per BLAKE3 hash
//! - **Capability sharing**: a ticket is all a new device needs to join
//!
//! ## Quick Start
//!
//! ```ignore
//! use unisync_core::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open("~/.unisync/data").await?;
//!
//!     let ns = engine.get_or_create_namespace().await?;
//!     engine.write_file(ns, "hello.txt", "hello world").await?;
//!
//!     for entry in engine.list_files(ns, false)? {
//!         println!("{} {} bytes", entry.path, entry.length);
//!     }
//!
//!     println!("share: {}", engine.share(ns).await?);
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod nodes;
pub mod replica;
pub mod storage;
pub mod sync;
pub mod ticket;
pub mod types;

// Re-exports
pub use blobs::BlobStore;
pub use config::{EngineOptions, TransportConfig};
pub use engine::{Engine, EngineInfo};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use identity::Author;
pub use nodes::{NodeRecord, NodeSource, NodeStatus, ReconnectSummary};
pub use replica::{MergeReport, ReplicaState};
pub use storage::{NamespaceOrigin, NamespaceRecord, Storage};
pub use sync::{IrohOptions, MemoryNetwork, PeerReport, PeerStats, SyncReport};
pub use ticket::DocTicket;
pub use types::*;
