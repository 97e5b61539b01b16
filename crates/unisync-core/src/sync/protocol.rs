//! Point-to-point sync protocol
//!
//! Messages are serialized with postcard and carried in length-delimited
//! frames (4-byte big-endian length prefix) over one bidirectional stream.
//! Blob content never travels on this stream: each side pulls the blobs it
//! is missing through the transport's blob fetcher, which runs the
//! iroh-blobs protocol and verifies content against its hash.
//!
//! ## Protocol Overview
//!
//! 1. **Hello / Welcome**: exchange node addresses; ids must match the
//!    transport-authenticated identity
//! 2. **Offer / Delta**: client offers its entry heads, server answers with
//!    entries the client lacks and paths it wants back
//! 3. **Push / Applied**: client pushes the wanted entries, server pulls the
//!    blobs it is missing from the client and reports what it fetched
//! 4. **Ping / Pong**: reachability probe; **Bye** ends the session
//!
//! ## Message Flow
//!
//! ```text
//! Client                               Server
//!   |--- Hello {node} ------------------>|
//!   |<-- Welcome {node} -----------------|
//!   |--- Offer {ns, heads} ------------->|
//!   |<-- Delta {entries, wanted} --------|
//!   |    (merge entries)                 |
//!   |--- Push {ns, entries} ------------>|
//!   |         <== blob fetch ==          |
//!   |<-- Applied {fetched} --------------|
//!   |    == blob fetch ==>               |
//!   |--- Bye --------------------------->|
//! ```

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{SyncError, SyncResult};
use crate::sync::transport::BoxedStream;
use crate::types::{EntryHead, Hash, NamespaceId, NodeAddr, SignedEntry};

/// ALPN protocol identifier for namespace sync
pub const SYNC_ALPN: &[u8] = b"/unisync/sync/1";

/// Default maximum frame size: 16 MiB
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages exchanged during a sync session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client introduces itself
    Hello { node: NodeAddr },
    /// Server introduces itself
    Welcome { node: NodeAddr },
    /// Client's current entry heads for a namespace
    Offer {
        namespace: NamespaceId,
        heads: Vec<EntryHead>,
    },
    /// Entries the client lacks, and paths the server wants
    Delta {
        entries: Vec<SignedEntry>,
        wanted: Vec<String>,
    },
    /// Server does not hold the namespace
    UnknownNamespace { namespace: NamespaceId },
    /// Client sends entries the server asked for
    Push {
        namespace: NamespaceId,
        entries: Vec<SignedEntry>,
    },
    /// Server merged a push and downloaded these blobs from the client
    Applied { fetched: Vec<Hash> },
    /// Reachability probe
    Ping,
    /// Probe reply
    Pong,
    /// Session refused or aborted
    Error { message: String },
    /// End of session
    Bye,
}

impl Message {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode message from bytes using postcard
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::Welcome { .. } => "Welcome",
            Message::Offer { .. } => "Offer",
            Message::Delta { .. } => "Delta",
            Message::UnknownNamespace { .. } => "UnknownNamespace",
            Message::Push { .. } => "Push",
            Message::Applied { .. } => "Applied",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Error { .. } => "Error",
            Message::Bye => "Bye",
        }
    }
}

/// Error for a message that is valid but not expected at this point
pub(crate) fn unexpected(msg: &Message, expected: &str) -> SyncError {
    match msg {
        Message::Error { message } => SyncError::Protocol(format!("Peer error: {}", message)),
        other => SyncError::Protocol(format!(
            "Unexpected {} message, expected {}",
            other.name(),
            expected
        )),
    }
}

/// A framed session stream speaking [`Message`]s.
pub struct FramedStream {
    inner: Framed<BoxedStream, LengthDelimitedCodec>,
    timeout: Duration,
}

impl FramedStream {
    /// Wrap a raw stream.
    ///
    /// Every receive fails with `Network` after `timeout` without a frame.
    pub fn new(stream: BoxedStream, max_frame_len: usize, timeout: Duration) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            inner: Framed::new(stream, codec),
            timeout,
        }
    }

    /// Send one message
    pub async fn send(&mut self, msg: &Message) -> SyncResult<()> {
        let bytes = msg
            .encode()
            .map_err(|e| SyncError::Serialization(format!("Failed to encode {}: {}", msg.name(), e)))?;
        self.inner
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| SyncError::Network(format!("Failed to send {}: {}", msg.name(), e)))
    }

    async fn next_frame(&mut self) -> SyncResult<Option<BytesMut>> {
        match tokio::time::timeout(self.timeout, self.inner.next()).await {
            Err(_) => Err(SyncError::Network(format!(
                "No message from peer within {:?}",
                self.timeout
            ))),
            Ok(None) => Ok(None),
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(e))) => Err(SyncError::Network(format!("Failed to read frame: {}", e))),
        }
    }

    /// Receive the next message, `None` when the peer closed the stream
    pub async fn recv(&mut self) -> SyncResult<Option<Message>> {
        match self.next_frame().await? {
            Some(frame) => Message::decode(&frame)
                .map(Some)
                .map_err(|e| SyncError::Protocol(format!("Malformed message: {}", e))),
            None => Ok(None),
        }
    }

    /// Receive the next message, treating end of stream as an error
    pub async fn expect(&mut self) -> SyncResult<Message> {
        self.recv()
            .await?
            .ok_or_else(|| SyncError::Network("Peer closed the session".into()))
    }

    /// Close our side of the stream
    pub async fn close(&mut self) -> SyncResult<()> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to close stream: {}", e)))
    }

    /// Say goodbye, close our side and wait for the peer to close theirs
    pub async fn finish(&mut self) -> SyncResult<()> {
        self.send(&Message::Bye).await?;
        self.close().await?;
        while self.next_frame().await?.is_some() {}
        Ok(())
    }
}
