//! Shared peer types.

use std::net;

use bitcoin::network::constants::ServiceFlags;

use crate::net::{Link, LocalTime};

/// Discovery source. Specifies which method produced a peer candidate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// An address resolved from a DNS seed.
    Dns,
    /// An address drawn from the configured static peer list.
    Static,
    /// A session established through the peer exchange, eg. a web seed or a
    /// peer introduced by another web peer.
    Exchange,
    /// A transport produced by a user-provided candidate producer.
    Custom,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns => write!(f, "DNS"),
            Self::Static => write!(f, "static"),
            Self::Exchange => write!(f, "exchange"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// A snapshot of an admitted peer, as handed out to API consumers.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: net::SocketAddr,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// Negotiated protocol version.
    pub version: u32,
}

impl Peer {
    /// Check if this is an outbound peer.
    pub fn is_outbound(&self) -> bool {
        self.link.is_outbound()
    }
}
