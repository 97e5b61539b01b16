//! Engine configuration
//!
//! [`EngineOptions`] carries everything an integrator can tune when opening an
//! engine. The defaults suit a device on the public internet: iroh transport
//! with relays, and timeouts generous enough for slow mobile links.
//!
//! ```ignore
//! let options = EngineOptions::default()
//!     .with_iroh(IrohOptions::default().with_relay(false))
//!     .with_listen_interval(Duration::from_secs(10));
//! let engine = Engine::open_with("/data/unisync", options).await?;
//! ```

use std::time::Duration;

use crate::sync::{IrohOptions, MemoryNetwork, SyncOptions, DEFAULT_MAX_FRAME_LEN};

/// Which network substrate the engine uses
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// iroh QUIC endpoint
    Iroh(IrohOptions),
    /// Shared in-process network
    Memory(MemoryNetwork),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Iroh(IrohOptions::default())
    }
}

/// Options for [`crate::Engine::open_with`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub transport: TransportConfig,
    /// Time allowed to connect to a peer and complete the handshake
    pub connect_timeout: Duration,
    /// Time allowed between two frames from a peer
    pub io_timeout: Duration,
    /// Time allowed for a whole session with one peer
    pub peer_timeout: Duration,
    /// Pause between rounds of a background listener
    pub listen_interval: Duration,
    /// Largest accepted protocol frame
    pub max_frame_len: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let sync = SyncOptions::default();
        Self {
            transport: TransportConfig::default(),
            connect_timeout: sync.connect_timeout,
            io_timeout: sync.io_timeout,
            peer_timeout: sync.peer_timeout,
            listen_interval: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl EngineOptions {
    /// Options for an engine on an in-process network
    pub fn memory(network: MemoryNetwork) -> Self {
        Self::default().with_memory(network)
    }

    pub fn with_iroh(mut self, options: IrohOptions) -> Self {
        self.transport = TransportConfig::Iroh(options);
        self
    }

    pub fn with_memory(mut self, network: MemoryNetwork) -> Self {
        self.transport = TransportConfig::Memory(network);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn with_listen_interval(mut self, interval: Duration) -> Self {
        self.listen_interval = interval;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Session limits derived from these options
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            peer_timeout: self.peer_timeout,
            max_frame_len: self.max_frame_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_iroh() {
        let options = EngineOptions::default();
        assert!(matches!(options.transport, TransportConfig::Iroh(ref o) if o.relay));
        assert_eq!(options.max_frame_len, 16 * 1024 * 1024);
    }

    #[test]
    fn test_builders_feed_sync_options() {
        let options = EngineOptions::memory(MemoryNetwork::new())
            .with_connect_timeout(Duration::from_secs(1))
            .with_io_timeout(Duration::from_secs(2))
            .with_peer_timeout(Duration::from_secs(3))
            .with_max_frame_len(1024);

        assert!(matches!(options.transport, TransportConfig::Memory(_)));
        let sync = options.sync_options();
        assert_eq!(sync.connect_timeout, Duration::from_secs(1));
        assert_eq!(sync.io_timeout, Duration::from_secs(2));
        assert_eq!(sync.peer_timeout, Duration::from_secs(3));
        assert_eq!(sync.max_frame_len, 1024);
    }
}
