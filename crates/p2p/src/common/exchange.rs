//! The peer-exchange collaborator.
//!
//! The exchange introduces peers over transports the group can't dial
//! directly (websocket gateways, WebRTC). Implementations negotiate the
//! session themselves and hand the group an established stream; the group
//! identifies its network to the exchange by the lowercase-hex message magic
//! (see `flock_types::Params::magic_hex`).
use std::net;

use async_trait::async_trait;
use thiserror::Error;

/// Websocket transport name.
pub const TRANSPORT_WEBSOCKET: &str = "websocket";
/// WebRTC transport name.
pub const TRANSPORT_WEBRTC: &str = "webrtc";

/// Options for connecting or accepting through a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportOpts {
    /// Remote port to connect to, or local port to accept on.
    pub port: u16,
}

/// An error reported by the exchange.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested transport is not available on this platform.
    #[error("Transport {0:?} not found")]
    TransportNotFound(String),
    /// An I/O error on the underlying session.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Any other exchange failure.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check whether this is a missing-transport error for the given
    /// transport.
    pub fn is_transport_not_found(&self, transport: &str) -> bool {
        matches!(self, Self::TransportNotFound(t) if t == transport)
    }
}

/// Handle to a peer-exchange implementation.
///
/// All session negotiation happens inside the implementation; streams
/// returned here are connected and ready to carry protocol bytes.
#[async_trait]
pub trait Exchange: Send {
    /// Open an outbound session over the given transport.
    async fn connect(
        &mut self,
        transport: &str,
        address: &str,
        opts: TransportOpts,
    ) -> Result<(net::TcpStream, net::SocketAddr), Error>;

    /// Start accepting inbound sessions over the given transport. Accepted
    /// peers are surfaced through [`Exchange::incoming`].
    async fn accept(&mut self, transport: &str, opts: TransportOpts) -> Result<(), Error>;

    /// Stop accepting inbound sessions over the given transport.
    async fn unaccept(&mut self, transport: &str) -> Result<(), Error>;

    /// Ask a connected web peer to introduce a new peer.
    async fn get_new_peer(&mut self) -> Result<(net::TcpStream, net::SocketAddr), Error>;

    /// Addresses of the currently connected web peers.
    fn peers(&self) -> Vec<net::SocketAddr>;

    /// Drain one accepted inbound peer, if any.
    fn incoming(&mut self) -> Option<(net::TcpStream, net::SocketAddr)>;
}

/// Enable inbound acceptance: websocket first, then webrtc. A platform
/// without webrtc is fine; any other webrtc failure undoes the websocket
/// acceptance.
pub async fn enable_accept<E: Exchange + ?Sized>(
    exchange: &mut E,
    opts: TransportOpts,
) -> Result<(), Error> {
    exchange.accept(TRANSPORT_WEBSOCKET, opts).await?;

    match exchange.accept(TRANSPORT_WEBRTC, opts).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_transport_not_found(TRANSPORT_WEBRTC) => Ok(()),
        Err(err) => {
            exchange.unaccept(TRANSPORT_WEBSOCKET).await.ok();
            Err(err)
        }
    }
}

/// Disable inbound acceptance on both transports, surfacing the first
/// failure. A missing webrtc transport is not a failure.
pub async fn disable_accept<E: Exchange + ?Sized>(exchange: &mut E) -> Result<(), Error> {
    let websocket = exchange.unaccept(TRANSPORT_WEBSOCKET).await;
    let webrtc = exchange.unaccept(TRANSPORT_WEBRTC).await;

    websocket?;
    match webrtc {
        Err(err) if !err.is_transport_not_found(TRANSPORT_WEBRTC) => Err(err),
        _ => Ok(()),
    }
}

/// An exchange for deployments without web transports. Every transport
/// reports as missing and no peers are ever introduced.
#[derive(Debug, Clone, Default)]
pub struct NullExchange;

#[async_trait]
impl Exchange for NullExchange {
    async fn connect(
        &mut self,
        transport: &str,
        _address: &str,
        _opts: TransportOpts,
    ) -> Result<(net::TcpStream, net::SocketAddr), Error> {
        Err(Error::TransportNotFound(transport.to_owned()))
    }

    async fn accept(&mut self, transport: &str, _opts: TransportOpts) -> Result<(), Error> {
        Err(Error::TransportNotFound(transport.to_owned()))
    }

    async fn unaccept(&mut self, transport: &str) -> Result<(), Error> {
        Err(Error::TransportNotFound(transport.to_owned()))
    }

    async fn get_new_peer(&mut self) -> Result<(net::TcpStream, net::SocketAddr), Error> {
        Err(Error::TransportNotFound(TRANSPORT_WEBSOCKET.to_owned()))
    }

    fn peers(&self) -> Vec<net::SocketAddr> {
        Vec::new()
    }

    fn incoming(&mut self) -> Option<(net::TcpStream, net::SocketAddr)> {
        None
    }
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Exchange {}

    #[async_trait]
    impl Exchange for Exchange {
        async fn connect(
            &mut self,
            transport: &str,
            address: &str,
            opts: TransportOpts,
        ) -> Result<(net::TcpStream, net::SocketAddr), Error>;
        async fn accept(&mut self, transport: &str, opts: TransportOpts) -> Result<(), Error>;
        async fn unaccept(&mut self, transport: &str) -> Result<(), Error>;
        async fn get_new_peer(&mut self) -> Result<(net::TcpStream, net::SocketAddr), Error>;
        fn peers(&self) -> Vec<net::SocketAddr>;
        fn incoming(&mut self) -> Option<(net::TcpStream, net::SocketAddr)>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_not_found_message() {
        let err = Error::TransportNotFound(TRANSPORT_WEBRTC.to_owned());

        assert_eq!(err.to_string(), "Transport \"webrtc\" not found");
        assert!(err.is_transport_not_found(TRANSPORT_WEBRTC));
        assert!(!err.is_transport_not_found(TRANSPORT_WEBSOCKET));
    }
}
