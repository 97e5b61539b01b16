//! Document tickets
//!
//! A ticket carries everything a new peer needs to join a namespace:
//! - The namespace id
//! - Address hints for one or more nodes that hold it
//!
//! Tickets are encoded as `docticket1:{base58}` strings. The digit after the
//! prefix is the format version, so tickets from a newer release are rejected
//! with a clear error instead of being misparsed. The postcard payload carries
//! the version a second time, which must agree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::{NamespaceId, NodeAddr};

/// Prefix for encoded ticket strings, followed by the version and `:`
const TICKET_PREFIX: &str = "docticket";

/// Current ticket format version
pub const TICKET_VERSION: u8 = 1;

/// A shareable capability to locate and sync a namespace.
///
/// Tickets are stateless and never expire; the same string can be imported
/// any number of times.
///
/// # Example
///
/// ```ignore
/// let ticket = engine.share(ns).await?;
/// let text = ticket.to_string();
/// let parsed: DocTicket = text.parse()?;
/// assert_eq!(parsed, ticket);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocTicket {
    /// Format version, always [`TICKET_VERSION`] for tickets built here
    pub version: u8,
    /// Namespace to join
    pub namespace: NamespaceId,
    /// Nodes that hold the namespace
    pub nodes: Vec<NodeAddr>,
}

impl DocTicket {
    pub fn new(namespace: NamespaceId, nodes: Vec<NodeAddr>) -> Self {
        Self {
            version: TICKET_VERSION,
            namespace,
            nodes,
        }
    }

    /// Encode the ticket to a `docticket1:{base58}` string.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<String, SyncError> {
        let bytes = postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode ticket: {}", e)))?;
        let encoded = bs58::encode(&bytes).into_string();
        Ok(format!("{}{}:{}", TICKET_PREFIX, self.version, encoded))
    }

    /// Decode a ticket string.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidTicket` if:
    /// - The string doesn't start with `docticket<version>:`
    /// - The version is not supported
    /// - The base58 encoding or binary payload is malformed
    /// - The ticket names no nodes
    pub fn decode(s: &str) -> Result<Self, SyncError> {
        let s = s.trim();
        let rest = s.strip_prefix(TICKET_PREFIX).ok_or_else(|| {
            SyncError::InvalidTicket(format!(
                "Invalid prefix: expected '{}', got '{}'",
                TICKET_PREFIX,
                s.chars().take(12).collect::<String>()
            ))
        })?;

        let (version, data) = rest
            .split_once(':')
            .ok_or_else(|| SyncError::InvalidTicket("Missing ':' after ticket version".into()))?;
        let version: u8 = version
            .parse()
            .map_err(|_| SyncError::InvalidTicket(format!("Invalid ticket version '{}'", version)))?;
        if version != TICKET_VERSION {
            return Err(SyncError::InvalidTicket(format!(
                "Unsupported ticket version {} (this build reads version {})",
                version, TICKET_VERSION
            )));
        }

        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|e| SyncError::InvalidTicket(format!("Invalid base58: {}", e)))?;

        let ticket: DocTicket = postcard::from_bytes(&bytes)
            .map_err(|e| SyncError::InvalidTicket(format!("Invalid ticket data: {}", e)))?;

        if ticket.version != version {
            return Err(SyncError::InvalidTicket(format!(
                "Ticket payload version {} does not match prefix version {}",
                ticket.version, version
            )));
        }
        if ticket.nodes.is_empty() {
            return Err(SyncError::InvalidTicket("Ticket lists no nodes".into()));
        }

        Ok(ticket)
    }
}

impl fmt::Display for DocTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode().map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

impl FromStr for DocTicket {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::NodeId;

    fn test_ticket() -> DocTicket {
        DocTicket::new(
            NamespaceId::from_bytes([5u8; 32]),
            vec![NodeAddr::new(NodeId::from_bytes([6u8; 32]))
                .with_relay_url("https://relay.example.com./")
                .with_direct_addresses(["192.168.1.1:4433", "[::1]:4433"])],
        )
    }

    #[test]
    fn test_ticket_encode_decode_roundtrip() {
        let ticket = test_ticket();
        let encoded = ticket.encode().unwrap();
        assert!(encoded.starts_with("docticket1:"));

        let decoded = DocTicket::decode(&encoded).unwrap();
        assert_eq!(decoded, ticket);
    }

    #[test]
    fn test_display_fromstr_roundtrip() {
        let ticket = test_ticket();
        let parsed: DocTicket = ticket.to_string().parse().unwrap();
        assert_eq!(parsed, ticket);
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        let ticket = test_ticket();
        let padded = format!("  {}\n", ticket);
        assert_eq!(DocTicket::decode(&padded).unwrap(), ticket);
    }

    #[test]
    fn test_wrong_prefix() {
        let err = DocTicket::decode("sync-invite:abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTicket);
        assert!(err.to_string().contains("Invalid prefix"));
    }

    #[test]
    fn test_future_version_rejected() {
        let encoded = test_ticket().encode().unwrap();
        let future = encoded.replacen("docticket1:", "docticket2:", 1);
        let err = DocTicket::decode(&future).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTicket);
        assert!(err.to_string().contains("Unsupported ticket version 2"));
    }

    #[test]
    fn test_payload_version_must_match_prefix() {
        let mut ticket = test_ticket();
        ticket.version = 7;
        let bytes = postcard::to_allocvec(&ticket).unwrap();
        let forged = format!("docticket1:{}", bs58::encode(bytes).into_string());
        let err = DocTicket::decode(&forged).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_invalid_base58() {
        let err = DocTicket::decode("docticket1:0OIl").unwrap_err();
        assert!(err.to_string().contains("Invalid base58"));
    }

    #[test]
    fn test_garbage_payload() {
        let garbage = bs58::encode([1u8, 2, 3]).into_string();
        let err = DocTicket::decode(&format!("docticket1:{}", garbage)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTicket);
    }

    #[test]
    fn test_missing_version_separator() {
        assert!(DocTicket::decode("docticket1abc").is_err());
        assert!(DocTicket::decode("docticket").is_err());
    }

    #[test]
    fn test_ticket_without_nodes_rejected() {
        let ticket = DocTicket::new(NamespaceId::from_bytes([1u8; 32]), vec![]);
        let encoded = ticket.encode().unwrap();
        assert!(DocTicket::decode(&encoded).is_err());
    }
}
