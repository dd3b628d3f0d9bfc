//! Peer discovery.
//!
//! Every connection attempt draws one candidate from one of the enabled
//! discovery methods, chosen uniformly at random. The eligible set is
//! rebuilt per attempt: the exchange only becomes a usable source once it
//! has at least one connected web peer.
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveError,
    TokioAsyncResolver,
};

use flock_types::Params;

use crate::common::exchange::{self, Exchange};
use crate::common::peer::Source;

/// A user-provided candidate producer (the `getNewPeer` configuration entry).
#[async_trait]
pub trait Producer: Send + Sync {
    /// Produce one established transport.
    async fn produce(&mut self) -> Result<(std::net::TcpStream, SocketAddr), io::Error>;
}

/// One candidate connection.
#[derive(Debug)]
pub enum Candidate {
    /// An address to dial.
    Dial(SocketAddr, Source),
    /// An established stream to take over.
    Stream(std::net::TcpStream, SocketAddr, Source),
}

/// A failed discovery attempt.
#[derive(Error, Debug)]
pub enum Error {
    #[error("No methods available to get new peers")]
    NoMethods,
    #[error("failed to resolve {name}: {error}")]
    Resolve {
        name: String,
        #[source]
        error: ResolveError,
    },
    #[error("{0} resolved to no addresses")]
    NoAddresses(String),
    #[error("invalid static peer entry {0:?}")]
    InvalidStaticPeer(String),
    #[error(transparent)]
    Exchange(#[from] exchange::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The discovery methods a candidate can be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Dns,
    Static,
    Exchange,
    Custom,
}

/// Draws peer candidates from the configured discovery methods.
pub struct Discovery {
    params: Params,
    /// Whether exchange-based discovery is enabled.
    connect_web: bool,
    resolver: TokioAsyncResolver,
    custom: Option<Box<dyn Producer>>,
    rng: fastrand::Rng,
}

impl Discovery {
    pub fn new(
        params: Params,
        connect_web: bool,
        custom: Option<Box<dyn Producer>>,
        rng: fastrand::Rng,
    ) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        Self {
            params,
            connect_web,
            resolver,
            custom,
            rng,
        }
    }

    /// Network parameters the discovery draws from.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Draw one candidate from a uniformly chosen enabled method.
    pub async fn candidate<E: Exchange + ?Sized>(
        &mut self,
        exchange: &mut E,
    ) -> Result<Candidate, Error> {
        let mut methods = Vec::with_capacity(4);

        if !self.params.dns_seeds.is_empty() {
            methods.push(Method::Dns);
        }
        if !self.params.static_peers.is_empty() {
            methods.push(Method::Static);
        }
        if self.connect_web && !exchange.peers().is_empty() {
            methods.push(Method::Exchange);
        }
        if self.custom.is_some() {
            methods.push(Method::Custom);
        }

        if methods.is_empty() {
            return Err(Error::NoMethods);
        }
        let method = methods[self.rng.usize(..methods.len())];
        debug!(target: "p2p", "Getting new peer candidate via {:?}", method);

        match method {
            Method::Dns => self.from_dns().await,
            Method::Static => self.from_static().await,
            Method::Exchange => {
                let (stream, addr) = exchange.get_new_peer().await?;

                Ok(Candidate::Stream(stream, addr, Source::Exchange))
            }
            Method::Custom => {
                let producer = self.custom.as_mut().expect("method is only eligible when set");
                let (stream, addr) = producer.produce().await?;

                Ok(Candidate::Stream(stream, addr, Source::Custom))
            }
        }
    }

    /// Resolve a random DNS seed and pick a random address from its records.
    async fn from_dns(&mut self) -> Result<Candidate, Error> {
        let seed = &self.params.dns_seeds[self.rng.usize(..self.params.dns_seeds.len())];

        let response = self
            .resolver
            .lookup_ip(seed.as_str())
            .await
            .map_err(|error| Error::Resolve {
                name: seed.clone(),
                error,
            })?;
        let ips = response.iter().collect::<Vec<_>>();

        if ips.is_empty() {
            return Err(Error::NoAddresses(seed.clone()));
        }
        let ip = ips[self.rng.usize(..ips.len())];

        Ok(Candidate::Dial(
            SocketAddr::new(ip, self.params.default_port),
            Source::Dns,
        ))
    }

    /// Parse a random entry of the static peer list, resolving hostnames.
    async fn from_static(&mut self) -> Result<Candidate, Error> {
        let entry = &self.params.static_peers[self.rng.usize(..self.params.static_peers.len())];

        let addr = self.parse_static(entry).await?;

        Ok(Candidate::Dial(addr, Source::Static))
    }

    /// Parse a `host[:port]` entry. The host may be an IP address or a
    /// hostname to resolve.
    async fn parse_static(&self, entry: &str) -> Result<SocketAddr, Error> {
        if let Ok(addr) = SocketAddr::from_str(entry) {
            return Ok(addr);
        }
        if let Ok(ip) = IpAddr::from_str(entry) {
            return Ok(SocketAddr::new(ip, self.params.default_port));
        }

        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidStaticPeer(entry.to_owned()))?;
                (host, port)
            }
            None => (entry, self.params.default_port),
        };
        if host.is_empty() {
            return Err(Error::InvalidStaticPeer(entry.to_owned()));
        }

        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|error| Error::Resolve {
                name: host.to_owned(),
                error,
            })?;
        let ip = response
            .iter()
            .next()
            .ok_or_else(|| Error::NoAddresses(host.to_owned()))?;

        Ok(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flock_types::Network;

    use crate::common::exchange::MockExchange;

    fn discovery(params: Params, connect_web: bool) -> Discovery {
        Discovery::new(params, connect_web, None, fastrand::Rng::with_seed(42))
    }

    #[tokio::test]
    async fn test_no_methods_available() {
        let mut params = Params::new(Network::Regtest);
        params.dns_seeds.clear();
        params.static_peers.clear();

        let mut exchange = MockExchange::new();
        exchange.expect_peers().return_const(Vec::new());

        let mut discovery = discovery(params, true);
        let err = discovery.candidate(&mut exchange).await.unwrap_err();

        assert_eq!(err.to_string(), "No methods available to get new peers");
    }

    #[tokio::test]
    async fn test_static_entries_parse() {
        let mut params = Params::new(Network::Regtest);
        params.static_peers = vec!["1.1.1.1:9000".into()];

        let mut exchange = MockExchange::new();
        exchange.expect_peers().return_const(Vec::new());

        let mut discovery = discovery(params, false);

        match discovery.candidate(&mut exchange).await.unwrap() {
            Candidate::Dial(addr, source) => {
                assert_eq!(addr, "1.1.1.1:9000".parse().unwrap());
                assert_eq!(source, Source::Static);
            }
            other => panic!("unexpected candidate: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_static_entry_without_port_uses_default() {
        let mut params = Params::new(Network::Regtest);
        params.static_peers = vec!["2.2.2.2".into()];

        let mut exchange = MockExchange::new();
        let mut discovery = discovery(params, false);

        match discovery.candidate(&mut exchange).await.unwrap() {
            Candidate::Dial(addr, _) => {
                assert_eq!(addr, "2.2.2.2:18444".parse().unwrap());
            }
            other => panic!("unexpected candidate: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_requires_web_peers() {
        // `connect_web` is on, but the exchange has no connected web peers:
        // the method is not eligible and the set is empty.
        let params = {
            let mut p = Params::new(Network::Regtest);
            p.dns_seeds.clear();
            p.static_peers.clear();
            p
        };
        let mut exchange = MockExchange::new();
        exchange.expect_peers().return_const(Vec::new());

        let mut discovery = discovery(params, true);
        let err = discovery.candidate(&mut exchange).await.unwrap_err();

        assert!(matches!(err, Error::NoMethods));
    }
}
