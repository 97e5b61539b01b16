//! iroh QUIC transport
//!
//! One iroh `Endpoint` per engine, keyed by the persisted endpoint secret so
//! the node id survives restarts. Peer addresses learned from tickets and the
//! node directory are fed to a `StaticProvider` so dialing does not depend on
//! DNS discovery. Inbound sessions arrive through a `Router` that hands each
//! connection's first bidirectional stream to the engine's [`InboundHandler`].
//!
//! The same router serves the iroh-blobs ALPN from the engine's blob store.
//! Every get request is intercepted and checked with
//! [`InboundHandler::may_fetch`], so peers only download blobs of namespaces
//! they share with this node.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, PublicKey, RelayUrl, SecretKey};
use iroh_blobs::provider::events::{
    AbortReason, ConnectMode, EventMask, EventSender, ProviderMessage, RequestMode,
};
use iroh_blobs::BlobsProtocol;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use super::protocol::SYNC_ALPN;
use super::transport::{BlobFetcher, InboundHandler, PeerStream, Transport};
use crate::blobs::BlobStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{Hash, NodeAddr, NodeId};

/// How long a served connection waits for the client to hang up
const LINGER: Duration = Duration::from_secs(5);
/// How long binding waits for local addresses to show up
const ADDR_WAIT: Duration = Duration::from_secs(2);

/// Settings of the iroh endpoint
#[derive(Debug, Clone)]
pub struct IrohOptions {
    /// Use the default relay servers; disable for LAN-only or test setups
    pub relay: bool,
    /// Fixed IPv4 port to bind; random when `None`
    pub bind_port: Option<u16>,
}

impl Default for IrohOptions {
    fn default() -> Self {
        Self {
            relay: true,
            bind_port: None,
        }
    }
}

impl IrohOptions {
    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }
}

/// Convert an iroh address into the engine's address form
pub fn node_addr_from_endpoint(addr: &EndpointAddr) -> NodeAddr {
    NodeAddr {
        node_id: NodeId::from(addr.id),
        relay_url: addr.relay_urls().next().map(|url| url.to_string()),
        direct_addresses: addr.ip_addrs().map(|a| a.to_string()).collect(),
    }
}

/// Convert an engine address into an iroh address.
///
/// # Errors
///
/// Returns `SyncError::InvalidInput` if the node id, relay URL or a socket
/// address is malformed.
pub fn endpoint_addr_from_node(addr: &NodeAddr) -> SyncResult<EndpointAddr> {
    let public_key = PublicKey::try_from(addr.node_id)?;
    let mut endpoint_addr = EndpointAddr::new(public_key);

    if let Some(ref relay) = addr.relay_url {
        let relay_url: RelayUrl = relay
            .parse()
            .map_err(|e| SyncError::InvalidInput(format!("Invalid relay URL: {}", e)))?;
        endpoint_addr = endpoint_addr.with_relay_url(relay_url);
    }

    for direct in &addr.direct_addresses {
        let socket_addr: SocketAddr = direct
            .parse()
            .map_err(|e| SyncError::InvalidInput(format!("Invalid socket address: {}", e)))?;
        endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
    }

    Ok(endpoint_addr)
}

/// One bidirectional QUIC stream, keeping its connection alive
struct IrohStream {
    _conn: Connection,
    io: tokio::io::Join<RecvStream, SendStream>,
}

impl IrohStream {
    fn new(conn: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            _conn: conn,
            io: tokio::io::join(recv, send),
        }
    }
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Provider events that reject get requests the handler does not allow
fn blob_access_events(handler: Arc<dyn InboundHandler>) -> EventSender {
    let mask = EventMask {
        connected: ConnectMode::Intercept,
        get: RequestMode::Intercept,
        get_many: RequestMode::Intercept,
        ..EventMask::DEFAULT
    };
    let (events, mut rx) = EventSender::channel(32, mask);

    tokio::spawn(async move {
        // Remote node of every open blob connection
        let mut peers: HashMap<u64, NodeId> = HashMap::new();
        let allowed = |peers: &HashMap<u64, NodeId>, connection: u64, hash: &iroh_blobs::Hash| {
            peers
                .get(&connection)
                .is_some_and(|peer| handler.may_fetch(peer, &Hash::from(*hash)))
        };

        while let Some(msg) = rx.recv().await {
            match msg {
                ProviderMessage::ClientConnected(msg) => {
                    let result = match msg.endpoint_id {
                        Some(id) => {
                            peers.insert(msg.connection_id, NodeId::from(id));
                            Ok(())
                        }
                        None => Err(AbortReason::Permission),
                    };
                    msg.tx.send(result).await.ok();
                }
                ProviderMessage::ConnectionClosed(msg) => {
                    peers.remove(&msg.connection_id);
                }
                ProviderMessage::GetRequestReceived(msg) => {
                    let result = if allowed(&peers, msg.connection_id, &msg.request.hash) {
                        Ok(())
                    } else {
                        debug!(hash = %msg.request.hash, "Refused blob request");
                        Err(AbortReason::Permission)
                    };
                    msg.tx.send(result).await.ok();
                }
                ProviderMessage::GetManyRequestReceived(msg) => {
                    let result = if msg
                        .request
                        .hashes
                        .iter()
                        .all(|hash| allowed(&peers, msg.connection_id, hash))
                    {
                        Ok(())
                    } else {
                        Err(AbortReason::Permission)
                    };
                    msg.tx.send(result).await.ok();
                }
                _ => {}
            }
        }
    });
    events
}

/// Downloads blobs over the endpoint into the engine's store
#[derive(Debug, Clone)]
struct IrohBlobFetcher {
    endpoint: Endpoint,
    static_provider: StaticProvider,
    blobs: BlobStore,
}

#[async_trait]
impl BlobFetcher for IrohBlobFetcher {
    async fn fetch_blob(&self, from: &NodeAddr, hash: &Hash) -> SyncResult<bool> {
        if from.has_hints() {
            self.static_provider.add_endpoint_info(endpoint_addr_from_node(from)?);
        }
        self.blobs.download(&self.endpoint, from.node_id, hash).await
    }
}

/// Router adapter for the sync ALPN
#[derive(Clone)]
struct SyncProtocol {
    endpoint: Endpoint,
    handler: Arc<dyn InboundHandler>,
    fetcher: IrohBlobFetcher,
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("endpoint", &self.endpoint.id())
            .field("handler", &"<InboundHandler>")
            .finish()
    }
}

impl ProtocolHandler for SyncProtocol {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let endpoint = self.endpoint.clone();
        let handler = self.handler.clone();
        let fetcher = self.fetcher.clone();

        async move {
            let remote = NodeId::from(conn.remote_id());
            debug!(peer = %remote.fmt_short(), "Accepting sync connection");

            let (send, recv) = conn.accept_bi().await.map_err(AcceptError::from_err)?;
            let peer = PeerStream {
                remote,
                stream: Box::new(IrohStream::new(conn.clone(), send, recv)),
            };
            let local = node_addr_from_endpoint(&endpoint.addr());

            if let Err(e) = handler.handle(peer, local, &fetcher).await {
                return Err(AcceptError::from_err(e));
            }

            // Let the client read our last frames before the connection drops.
            let _ = tokio::time::timeout(LINGER, conn.closed()).await;
            Ok(())
        }
    }
}

/// Production transport over iroh
#[derive(Debug, Clone)]
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    fetcher: IrohBlobFetcher,
}

impl IrohTransport {
    /// Bind an endpoint with `secret` and start serving the sync and blob
    /// ALPNs.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Network` if the endpoint cannot be bound.
    pub async fn bind(
        secret: [u8; 32],
        options: &IrohOptions,
        handler: Arc<dyn InboundHandler>,
        blobs: BlobStore,
    ) -> SyncResult<Self> {
        let static_provider = StaticProvider::new();

        let mut builder = Endpoint::builder()
            .secret_key(SecretKey::from_bytes(&secret))
            .alpns(vec![SYNC_ALPN.to_vec(), iroh_blobs::ALPN.to_vec()])
            .discovery(static_provider.clone());
        if !options.relay {
            builder = builder.relay_mode(iroh::RelayMode::Disabled);
        }
        if let Some(port) = options.bind_port {
            builder = builder.bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        }

        let endpoint = builder
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), relay = options.relay, "Endpoint bound");

        // Local addresses are discovered asynchronously; give tickets a chance
        // to carry them.
        let deadline = tokio::time::Instant::now() + ADDR_WAIT;
        while endpoint.addr().ip_addrs().next().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let fetcher = IrohBlobFetcher {
            endpoint: endpoint.clone(),
            static_provider: static_provider.clone(),
            blobs: blobs.clone(),
        };
        let blobs_protocol = BlobsProtocol::new(&blobs.store(), Some(blob_access_events(handler.clone())));
        let protocol = SyncProtocol {
            endpoint: endpoint.clone(),
            handler,
            fetcher: fetcher.clone(),
        };
        let router = Router::builder(endpoint.clone())
            .accept(SYNC_ALPN, protocol)
            .accept(iroh_blobs::ALPN, blobs_protocol)
            .spawn();

        Ok(Self {
            endpoint,
            router,
            static_provider,
            fetcher,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl BlobFetcher for IrohTransport {
    async fn fetch_blob(&self, from: &NodeAddr, hash: &Hash) -> SyncResult<bool> {
        self.fetcher.fetch_blob(from, hash).await
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn node_id(&self) -> NodeId {
        NodeId::from(self.endpoint.id())
    }

    fn node_addr(&self) -> NodeAddr {
        node_addr_from_endpoint(&self.endpoint.addr())
    }

    fn add_node_addr(&self, addr: &NodeAddr) -> SyncResult<()> {
        if !addr.has_hints() {
            return Ok(());
        }
        let endpoint_addr = endpoint_addr_from_node(addr)?;
        debug!(peer = %addr.node_id.fmt_short(), "Adding node address to static discovery");
        self.static_provider.add_endpoint_info(endpoint_addr);
        Ok(())
    }

    async fn connect(&self, addr: &NodeAddr) -> SyncResult<PeerStream> {
        let endpoint_addr = endpoint_addr_from_node(addr)?;
        let conn = self
            .endpoint
            .connect(endpoint_addr, SYNC_ALPN)
            .await
            .map_err(|e| {
                SyncError::Network(format!("Failed to connect to {}: {}", addr.node_id.fmt_short(), e))
            })?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to open stream: {}", e)))?;

        Ok(PeerStream {
            remote: NodeId::from(conn.remote_id()),
            stream: Box::new(IrohStream::new(conn, send, recv)),
        })
    }

    async fn shutdown(&self) -> SyncResult<()> {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        info!("iroh transport shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_conversion_roundtrip() {
        let secret = SecretKey::from_bytes(&[7u8; 32]);
        let node = NodeAddr::new(NodeId::from(secret.public()))
            .with_relay_url("https://relay.example.com./")
            .with_direct_addresses(["192.168.1.1:4433"]);

        let endpoint_addr = endpoint_addr_from_node(&node).unwrap();
        assert_eq!(endpoint_addr.relay_urls().count(), 1);
        assert_eq!(endpoint_addr.ip_addrs().count(), 1);

        let back = node_addr_from_endpoint(&endpoint_addr);
        assert_eq!(back.node_id, node.node_id);
        assert_eq!(back.direct_addresses, node.direct_addresses);
        assert!(back.relay_url.is_some());
    }

    #[test]
    fn test_bad_socket_address_rejected() {
        let secret = SecretKey::from_bytes(&[7u8; 32]);
        let node = NodeAddr::new(NodeId::from(secret.public())).with_direct_addresses(["not-an-addr"]);
        assert!(endpoint_addr_from_node(&node).is_err());
    }

    #[test]
    fn test_options_builders() {
        let options = IrohOptions::default().with_relay(false).with_bind_port(4433);
        assert!(!options.relay);
        assert_eq!(options.bind_port, Some(4433));
    }
}
