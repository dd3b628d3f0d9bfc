//! Peer lifecycle and pool replenishment.
//!
//! Tracks every connection from dial (or adoption) through handshake to
//! admission into the pool, and keeps the number of admitted peers at the
//! configured target while the group is connecting.
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message_network::VersionMessage;
use tracing::debug;

use crate::{
    common::exchange::{Exchange, TransportOpts},
    common::peer::{Peer, Source},
    common::time::Clock,
    fsm::discovery::{self, Candidate, Discovery},
    fsm::handler::{DisconnectReason, PeerId},
    net::{Disconnect as NetDisconnect, Link, LocalDuration, LocalTime},
};

use super::output::{Adopt, Connect, Disconnect, SetTimer, Wire};

/// Time to wait for response during peer handshake before disconnecting the peer.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(12);
/// Default time to wait for a new connection to be established.
pub const DEFAULT_CONNECT_TIMEOUT: LocalDuration = LocalDuration::from_millis(8000);
/// Time to wait until idle maintenance runs.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);
/// Time to wait before re-attempting discovery after a failed attempt.
pub const RETRY_DELAY: LocalDuration = LocalDuration::from_secs(1);
/// Default target number of admitted peers.
pub const DEFAULT_TARGET_PEERS: usize = 8;
/// Minimum protocol version supported on the other side.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connecting to a peer found from the specified source.
    Connecting(PeerId, Source),
    /// A new connection is established and is ready for the handshake.
    /// This event is triggered *before* the peer handshake
    /// has successfully completed.
    Connected(PeerId, Link),
    /// The `version` message was received from a peer.
    VersionReceived {
        /// The peer's id.
        addr: PeerId,
        /// The version message.
        msg: VersionMessage,
    },
    /// A peer has become ready and was admitted into the pool.
    Negotiated {
        /// The peer's id.
        addr: PeerId,
        /// Connection link.
        link: Link,
        /// Services offered by negotiated peer.
        services: ServiceFlags,
        /// Peer user agent.
        user_agent: String,
        /// Protocol version.
        version: u32,
    },
    /// A connection attempt failed before the peer became ready.
    ConnectionFailed(PeerId, Arc<io::Error>),
    /// A discovery attempt produced no candidate.
    DiscoveryFailed(Arc<discovery::Error>),
    /// An admitted peer has been disconnected.
    Disconnected(PeerId, NetDisconnect<DisconnectReason>),
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting(addr, source) => {
                write!(fmt, "Connecting to peer {} from source `{}`", addr, source)
            }
            Self::Connected(addr, link) => write!(fmt, "{}: Peer connected ({:?})", &addr, link),
            Self::VersionReceived { addr, msg } => write!(
                fmt,
                "Peer address = {}, version = {}, agent = {}, services = {}, nonce = {}",
                addr, msg.version, msg.user_agent, msg.services, msg.nonce,
            ),
            Self::Negotiated {
                addr, services, ..
            } => write!(fmt, "{}: Peer negotiated with services {}", addr, services),
            Self::ConnectionFailed(addr, err) => {
                write!(fmt, "{}: Peer connection attempt failed: {}", &addr, err)
            }
            Self::DiscoveryFailed(err) => {
                write!(fmt, "Peer discovery attempt failed: {}", err)
            }
            Self::Disconnected(addr, reason) => {
                write!(fmt, "Disconnected from {} ({})", &addr, reason)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target number of admitted peers.
    pub target_peers: usize,
    /// Never let the pool grow beyond the target: admitting a peer over the
    /// limit evicts the oldest one.
    pub hard_limit: bool,
    /// Time to wait for a new connection to be established.
    pub connect_timeout: LocalDuration,
    /// Whether exchange-based (web) connectivity is enabled.
    pub connect_web: bool,
    /// Protocol version.
    pub protocol_version: u32,
    /// Services offered by this implementation.
    pub services: ServiceFlags,
    /// Our user agent.
    pub user_agent: &'static str,
}

/// Group connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `connect` hasn't been called yet.
    Idle,
    /// The pool is being maintained at the target size.
    Connecting,
    /// The group is shutting down; no admissions happen anymore.
    Closed,
}

/// Peer handshake state.
#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Ord, Eq)]
enum HandshakeState {
    /// Received "version" and waiting for "verack" message from remote.
    AwaitingVerack { since: LocalTime },
    /// Received "verack". Handshake is complete.
    Negotiated { since: LocalTime },
}

/// An established connection. Peers that haven't yet sent their `version`
/// message are stored as bare connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Remote peer address.
    pub addr: SocketAddr,
    /// Local peer address.
    pub local_addr: SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
}

/// A peer with protocol information.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// Whether this peer relays transactions.
    pub relay: bool,
    /// The negotiated protocol version.
    pub version: u32,
    /// Peer handshake state.
    state: HandshakeState,
}

impl PeerInfo {
    /// Check whether the peer has finished negotiating and is ready.
    pub fn is_negotiated(&self) -> bool {
        matches!(self.state, HandshakeState::Negotiated { .. })
    }
}

/// Connection state of a single peer.
#[derive(Debug, Clone)]
enum PeerState {
    /// A connection is being attempted.
    Connecting {
        /// Time the connection was attempted.
        time: LocalTime,
    },
    /// A connection is established.
    Connected {
        /// Connection.
        conn: Connection,
        /// Peer information, if a `version` message was received.
        peer: Option<PeerInfo>,
    },
}

/// Manages peer connections, handshake and pool replenishment.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    /// Peer manager configuration.
    pub config: Config,
    phase: Phase,
    /// Connection states.
    peers_storage: HashMap<SocketAddr, PeerState>,
    /// Admitted peers, oldest first.
    admitted: Vec<PeerId>,
    /// Outstanding web-seed admissions before the pool starts filling from
    /// the other discovery methods.
    seed_gate: Option<usize>,
    /// Nonces sent in our `version` messages. Used to detect self-connections.
    local_nonces: HashSet<u64>,
    /// Last time idle maintenance ran.
    last_idle: Option<LocalTime>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U, C> PeerManager<U, C>
where
    U: Wire<Event> + SetTimer + Connect + Disconnect + Adopt,
    C: Clock,
{
    /// Create a new peer manager.
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            peers_storage: HashMap::new(),
            admitted: Vec::new(),
            seed_gate: None,
            local_nonces: HashSet::new(),
            last_idle: None,
            upstream,
            rng,
            clock,
        }
    }

    /// The current connection phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Begin maintaining the pool. On the first call the group moves from
    /// idle to connecting; subsequent calls are no-ops.
    ///
    /// When web connectivity is on and web seeds are configured, up to
    /// `max(1, target / 2)` seed sessions are opened first, and the remaining
    /// discovery methods only kick in once that many peers were admitted.
    pub async fn start<E: Exchange + ?Sized>(
        &mut self,
        discovery: &mut Discovery,
        exchange: &mut E,
    ) {
        if self.phase != Phase::Idle {
            return;
        }
        self.phase = Phase::Connecting;
        self.last_idle = Some(self.clock.local_time());
        self.upstream.set_timer(IDLE_TIMEOUT);

        let web_seeds = discovery.params().web_seeds.clone();

        if self.config.connect_web && !web_seeds.is_empty() {
            let n_seeds = usize::max(1, self.config.target_peers / 2).min(web_seeds.len());

            self.seed_gate = Some(n_seeds);

            for seed in web_seeds.iter().take(n_seeds) {
                let opts = TransportOpts { port: seed.port };

                match exchange.connect(&seed.transport, &seed.address, opts).await {
                    Ok((stream, addr)) => self.adopt_stream(addr, stream, Source::Exchange),
                    Err(err) => {
                        self.upstream.event(Event::DiscoveryFailed(Arc::new(err.into())));
                        self.connect_peer(discovery, exchange).await;
                    }
                }
            }
        } else {
            self.fill_peers(discovery, exchange).await;
        }
    }

    /// Issue one connection attempt per missing peer.
    pub async fn fill_peers<E: Exchange + ?Sized>(
        &mut self,
        discovery: &mut Discovery,
        exchange: &mut E,
    ) {
        if self.phase != Phase::Connecting {
            return;
        }
        let deficit = self.config.target_peers.saturating_sub(self.admitted.len());

        for _ in 0..deficit {
            self.connect_peer(discovery, exchange).await;
        }
    }

    /// Draw one candidate from discovery and start connecting to it.
    pub async fn connect_peer<E: Exchange + ?Sized>(
        &mut self,
        discovery: &mut Discovery,
        exchange: &mut E,
    ) {
        if self.phase != Phase::Connecting {
            return;
        }
        match discovery.candidate(exchange).await {
            Ok(Candidate::Dial(addr, source)) => {
                self.connect(&addr, source);
            }
            Ok(Candidate::Stream(stream, addr, source)) => {
                if self.is_connected(&addr) || self.is_connecting(&addr) {
                    // Already known; the duplicate session is dropped.
                    return;
                }
                self.adopt_stream(addr, stream, source);
            }
            Err(err) => {
                self.upstream.event(Event::DiscoveryFailed(Arc::new(err)));
                // Re-attempted by the next maintenance wake.
                self.upstream.set_timer(RETRY_DELAY);
            }
        }
    }

    /// Connect to a peer address.
    pub fn connect(&mut self, addr: &PeerId, source: Source) -> bool {
        let time = self.clock.local_time();

        if self.is_connected(addr) || self.is_connecting(addr) {
            return true;
        }

        self.peers_storage.insert(*addr, PeerState::Connecting { time });
        self.upstream.event(Event::Connecting(*addr, source));
        self.upstream.connect(*addr, self.config.connect_timeout);

        true
    }

    /// Hand an exchange-established outbound stream to the reactor.
    fn adopt_stream(&mut self, addr: SocketAddr, stream: std::net::TcpStream, source: Source) {
        let time = self.clock.local_time();

        self.peers_storage.insert(addr, PeerState::Connecting { time });
        self.upstream.event(Event::Connecting(addr, source));
        self.upstream.adopt(addr, stream, Link::Outbound);
    }

    /// Called when a peer connected.
    pub fn peer_connected(&mut self, addr: SocketAddr, local_addr: SocketAddr, link: Link) {
        let local_time = self.clock.local_time();

        #[cfg(debug_assertions)]
        if link.is_outbound() {
            debug_assert!(self.is_connecting(&addr), "{} is not connecting", addr)
        }
        debug_assert!(!self.is_connected(&addr), "{} is already connected", addr);

        self.peers_storage.insert(
            addr,
            PeerState::Connected {
                conn: Connection {
                    addr,
                    local_addr,
                    link,
                    since: local_time,
                },
                peer: None,
            },
        );

        if self.phase == Phase::Closed {
            // Discovery results arriving after close are discarded.
            self._disconnect(addr, DisconnectReason::Closing);
            return;
        }

        if link.is_outbound() {
            let nonce = self.rng.u64(..);
            let version = self.version(addr, local_addr, nonce);

            self.local_nonces.insert(nonce);
            self.upstream.version(addr, version);
        }
        // Set a timeout for receiving the `version` message.
        self.upstream.set_timer(HANDSHAKE_TIMEOUT);
        self.upstream.event(Event::Connected(addr, link));
    }

    /// Called when a `version` message was received.
    pub fn received_version(&mut self, addr: &PeerId, msg: VersionMessage) {
        if let Err(reason) = self.handle_version(addr, msg) {
            self._disconnect(*addr, reason);
        }
    }

    fn handle_version(&mut self, addr: &PeerId, msg: VersionMessage) -> Result<(), DisconnectReason> {
        let now = self.clock.local_time();

        let Some(PeerState::Connected { conn, peer }) = self.peers_storage.get(addr) else {
            return Ok(());
        };
        if peer.is_some() {
            return Err(DisconnectReason::PeerMisbehaving("redundant `version` message"));
        }
        let conn = conn.clone();

        self.upstream.event(Event::VersionReceived {
            addr: *addr,
            msg: msg.clone(),
        });

        let VersionMessage {
            version,
            services,
            user_agent,
            nonce,
            relay,
            ..
        } = msg;

        // Don't support peers with too old of a protocol version.
        if version < MIN_PROTOCOL_VERSION {
            return Err(DisconnectReason::PeerProtocolVersion(version));
        }
        // Check for self-connections: the nonce is one we handed out ourselves.
        if self.local_nonces.contains(&nonce) {
            return Err(DisconnectReason::SelfConnection);
        }

        if conn.link.is_inbound() {
            let our_nonce = self.rng.u64(..);
            let our_version = self.version(conn.addr, conn.local_addr, our_nonce);

            self.local_nonces.insert(our_nonce);
            self.upstream.version(conn.addr, our_version);
        }
        self.upstream.verack(*addr).set_timer(HANDSHAKE_TIMEOUT);

        self.peers_storage.insert(
            conn.addr,
            PeerState::Connected {
                conn,
                peer: Some(PeerInfo {
                    services,
                    user_agent,
                    relay,
                    version: u32::min(self.config.protocol_version, version),
                    state: HandshakeState::AwaitingVerack { since: now },
                }),
            },
        );

        Ok(())
    }

    /// Called when a `verack` message was received. On success the peer is
    /// ready, and is admitted into the pool.
    pub async fn received_verack<E: Exchange + ?Sized>(
        &mut self,
        addr: &PeerId,
        discovery: &mut Discovery,
        exchange: &mut E,
    ) -> Option<(PeerInfo, Connection)> {
        let local_time = self.clock.local_time();

        let Some(PeerState::Connected {
            peer: Some(peer),
            conn,
        }) = self.peers_storage.get_mut(addr)
        else {
            return None;
        };

        if let HandshakeState::AwaitingVerack { .. } = peer.state {
            if self.phase == Phase::Closed {
                // The group closed while this peer was shaking hands.
                self._disconnect(*addr, DisconnectReason::Closing);
                return None;
            }
            peer.state = HandshakeState::Negotiated { since: local_time };

            let info = peer.clone();
            let conn = conn.clone();

            self.upstream.event(Event::Negotiated {
                addr: *addr,
                link: conn.link,
                services: info.services,
                user_agent: info.user_agent.clone(),
                version: info.version,
            });
            self.admit(*addr, discovery, exchange).await;

            return Some((info, conn));
        }

        self._disconnect(
            *addr,
            DisconnectReason::PeerMisbehaving("unexpected `verack` message received"),
        );
        None
    }

    /// Admit a ready peer into the pool.
    async fn admit<E: Exchange + ?Sized>(
        &mut self,
        addr: PeerId,
        discovery: &mut Discovery,
        exchange: &mut E,
    ) {
        self.admitted.push(addr);

        if self.config.hard_limit && self.admitted.len() > self.config.target_peers {
            let oldest = self.admitted.remove(0);

            debug!(target: "p2p", "{}: Evicting oldest peer, pool over limit", oldest);
            self._disconnect(oldest, DisconnectReason::OverLimit);
        }

        if let Some(outstanding) = self.seed_gate {
            let outstanding = outstanding.saturating_sub(1);

            if outstanding == 0 {
                self.seed_gate = None;
                self.fill_peers(discovery, exchange).await;
            } else {
                self.seed_gate = Some(outstanding);
            }
        }
    }

    /// Called when a peer disconnected.
    pub async fn peer_disconnected<E: Exchange + ?Sized>(
        &mut self,
        addr: &SocketAddr,
        discovery: &mut Discovery,
        exchange: &mut E,
        reason: NetDisconnect<DisconnectReason>,
    ) {
        let Some(state) = self.peers_storage.remove(addr) else {
            return;
        };
        self.admitted.retain(|a| a != addr);

        match state {
            PeerState::Connected {
                peer: Some(peer), ..
            } if peer.is_negotiated() => {
                self.upstream.event(Event::Disconnected(*addr, reason));

                // An admitted peer dropped out; make sure the pool recovers
                // its target size.
                if self.phase == Phase::Connecting {
                    self.fill_peers(discovery, exchange).await;
                }
            }
            PeerState::Connecting { .. } | PeerState::Connected { .. } => {
                // The peer failed before it became ready.
                let err = match reason.io_error() {
                    Some(err) => err.clone(),
                    None => Arc::new(io::Error::new(
                        io::ErrorKind::TimedOut,
                        reason.to_string(),
                    )),
                };
                self.upstream.event(Event::ConnectionFailed(*addr, err));

                if self.phase == Phase::Connecting {
                    self.connect_peer(discovery, exchange).await;
                }
            }
        }
    }

    /// Called when a tick was received.
    pub async fn received_wake<E: Exchange + ?Sized>(
        &mut self,
        discovery: &mut Discovery,
        exchange: &mut E,
    ) {
        let local_time = self.clock.local_time();
        let mut timed_out = Vec::new();

        for (addr, state) in &self.peers_storage {
            match state {
                // Peers that have been dialing for too long.
                PeerState::Connecting { time } => {
                    if local_time - *time >= self.config.connect_timeout {
                        timed_out.push((*addr, DisconnectReason::ConnectionTimeout));
                    }
                }
                // Peers that haven't sent their `version` quickly enough.
                PeerState::Connected { conn, peer: None } => {
                    if local_time - conn.since >= HANDSHAKE_TIMEOUT {
                        timed_out.push((*addr, DisconnectReason::PeerTimeout("handshake")));
                    }
                }
                // Peers that haven't sent a `verack` quickly enough.
                PeerState::Connected {
                    peer: Some(peer), ..
                } => {
                    if let HandshakeState::AwaitingVerack { since } = peer.state {
                        if local_time - since >= HANDSHAKE_TIMEOUT {
                            timed_out.push((*addr, DisconnectReason::PeerTimeout("handshake")));
                        }
                    }
                }
            }
        }
        for (addr, reason) in timed_out {
            self._disconnect(addr, reason);
        }

        // Top up the pool: outstanding attempts stay equal to the deficit.
        if self.phase == Phase::Connecting && self.seed_gate.is_none() {
            let in_flight = self
                .peers_storage
                .len()
                .saturating_sub(self.admitted.len());
            let deficit = self
                .config
                .target_peers
                .saturating_sub(self.admitted.len() + in_flight);

            for _ in 0..deficit {
                self.connect_peer(discovery, exchange).await;
            }
        }

        if local_time - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.upstream.set_timer(IDLE_TIMEOUT);
            self.last_idle = Some(local_time);
        }
    }

    /// Shut the pool down: disconnect every peer, admitted or not. Returns
    /// the number of peers still admitted.
    pub fn close(&mut self) -> usize {
        self.phase = Phase::Closed;
        self.seed_gate = None;

        let peers = self.peers_storage.keys().copied().collect::<Vec<_>>();
        for addr in peers {
            self._disconnect(addr, DisconnectReason::Closing);
        }

        self.admitted.len()
    }

    /// Addresses of the admitted peers, oldest first.
    pub fn admitted(&self) -> &[PeerId] {
        &self.admitted
    }

    /// Pick an admitted peer uniformly at random.
    pub fn random_peer(&mut self) -> Option<PeerId> {
        if self.admitted.is_empty() {
            return None;
        }
        Some(self.admitted[self.rng.usize(..self.admitted.len())])
    }

    /// Snapshots of the admitted peers, oldest first.
    pub fn peers(&self) -> Vec<Peer> {
        self.admitted
            .iter()
            .filter_map(|addr| match self.peers_storage.get(addr) {
                Some(PeerState::Connected {
                    conn,
                    peer: Some(peer),
                }) => Some(Peer {
                    addr: conn.addr,
                    local_addr: conn.local_addr,
                    link: conn.link,
                    since: conn.since,
                    services: peer.services,
                    user_agent: peer.user_agent.clone(),
                    version: peer.version,
                }),
                _ => None,
            })
            .collect()
    }

    /// Check whether a peer is connecting.
    pub fn is_connecting(&self, addr: &PeerId) -> bool {
        self.peers_storage
            .get(addr)
            .map_or(false, |c| matches!(c, PeerState::Connecting { .. }))
    }

    /// Check whether a peer is connected.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers_storage
            .get(addr)
            .map_or(false, |c| matches!(c, PeerState::Connected { .. }))
    }

    /// Check whether a peer is admitted.
    pub fn is_admitted(&self, addr: &PeerId) -> bool {
        self.admitted.contains(addr)
    }

    /// Disconnect from a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        if self.is_connected(&addr) {
            self._disconnect(addr, reason);
        }
    }

    /// Disconnect a peer (internal).
    fn _disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.upstream.disconnect(addr, reason);
    }

    /// Create a `version` message for this peer.
    pub fn version(&self, addr: SocketAddr, local_addr: SocketAddr, nonce: u64) -> VersionMessage {
        VersionMessage {
            // Our max supported protocol version.
            version: self.config.protocol_version,
            // Local services.
            services: self.config.services,
            // Local time. Not used by the group.
            timestamp: 0,
            // Receiver address and services, as perceived by us.
            receiver: Address::new(&addr, ServiceFlags::NONE),
            // Local address (unreliable) and local services (same as `services` field)
            sender: Address::new(&local_addr, self.config.services),
            // A nonce to detect connections to self.
            nonce,
            // Our user agent string.
            user_agent: self.config.user_agent.to_owned(),
            // Blockchain height. The group tracks no chain state.
            start_height: 0,
            // Whether we want to receive transaction `inv` messages.
            relay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::network::constants::ServiceFlags;

    use flock_types::{Network, Params, WebSeed};

    use crate::common::exchange::MockExchange;
    use crate::common::time::{RefClock, SettableClock};
    use crate::fsm::event::Event as GroupEvent;
    use crate::fsm::handler::USER_AGENT;
    use crate::fsm::output::{Io, Outbox};

    struct Harness {
        mgr: PeerManager<Outbox, RefClock>,
        outbox: Outbox,
        discovery: Discovery,
        exchange: MockExchange,
        clock: RefClock,
    }

    impl Harness {
        fn new(params: Params, config: Config, exchange: MockExchange) -> Self {
            let outbox = Outbox::new(params.magic);
            let clock = RefClock::from(LocalTime::from_secs(100_000));
            let connect_web = config.connect_web;
            let discovery =
                Discovery::new(params, connect_web, None, fastrand::Rng::with_seed(7));
            let mgr = PeerManager::new(
                config,
                fastrand::Rng::with_seed(7),
                outbox.clone(),
                clock.clone(),
            );

            Self {
                mgr,
                outbox,
                discovery,
                exchange,
                clock,
            }
        }

        fn drain(&mut self) -> Vec<Io> {
            self.outbox.by_ref().collect()
        }

        /// Drive a dialed peer through connection and handshake.
        async fn establish(&mut self, addr: PeerId) {
            let local_addr = ([127, 0, 0, 1], 1234).into();

            self.mgr.peer_connected(addr, local_addr, Link::Outbound);
            self.mgr.received_version(&addr, version_msg(9));
            self.mgr
                .received_verack(&addr, &mut self.discovery, &mut self.exchange)
                .await;
        }

        fn elapse(&mut self, duration: LocalDuration) {
            let now = self.clock.local_time();
            self.clock.set(now + duration);
        }
    }

    fn config(target_peers: usize) -> Config {
        Config {
            target_peers,
            hard_limit: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_web: false,
            protocol_version: 70016,
            services: ServiceFlags::NONE,
            user_agent: USER_AGENT,
        }
    }

    fn version_msg(nonce: u64) -> VersionMessage {
        let addr = ([8, 8, 8, 8], 8333).into();

        VersionMessage {
            version: 70016,
            services: ServiceFlags::NETWORK,
            timestamp: 0,
            receiver: Address::new(&addr, ServiceFlags::NONE),
            sender: Address::new(&addr, ServiceFlags::NETWORK),
            nonce,
            user_agent: "/other:1.0/".to_owned(),
            start_height: 0,
            relay: false,
        }
    }

    fn connects(ios: &[Io]) -> Vec<PeerId> {
        ios.iter()
            .filter_map(|io| match io {
                Io::Connect(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    fn peer_events(ios: Vec<Io>) -> Vec<Event> {
        ios.into_iter()
            .filter_map(|io| match io {
                Io::Event(GroupEvent::Peer(event)) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn static_params(peers: &[&str]) -> Params {
        let mut params = Params::new(Network::Regtest);
        params.static_peers = peers.iter().map(|p| (*p).to_owned()).collect();
        params
    }

    #[tokio::test]
    async fn test_pool_fills_to_target_from_static_peers() {
        let params = static_params(&["1.1.1.1:9000", "2.2.2.2:9000", "3.3.3.3:9000"]);
        let mut h = Harness::new(params, config(3), MockExchange::new());

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        assert_eq!(h.mgr.phase(), Phase::Connecting);

        let mut rounds = 0;
        while h.mgr.admitted().len() < 3 {
            rounds += 1;
            assert!(rounds < 100, "pool never converged to the target");

            let ios = h.drain();
            for addr in connects(&ios) {
                h.establish(addr).await;
            }
            h.mgr.received_wake(&mut h.discovery, &mut h.exchange).await;
        }

        assert_eq!(h.mgr.admitted().len(), 3);
        assert_eq!(h.mgr.peers().len(), 3);
    }

    #[tokio::test]
    async fn test_replenishes_after_admitted_disconnect() {
        let params = static_params(&["1.1.1.1:9000"]);
        let mut h = Harness::new(params, config(2), MockExchange::new());
        let (one, two) = ("1.1.1.1:9000".parse().unwrap(), "2.2.2.2:9000".parse().unwrap());

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        h.mgr.connect(&one, Source::Static);
        h.mgr.connect(&two, Source::Static);
        h.establish(one).await;
        h.establish(two).await;
        assert_eq!(h.mgr.admitted().len(), 2);
        h.drain();

        let err = Arc::new(io::Error::from(io::ErrorKind::ConnectionReset));
        h.mgr
            .peer_disconnected(
                &one,
                &mut h.discovery,
                &mut h.exchange,
                NetDisconnect::ConnectionError(err),
            )
            .await;

        assert_eq!(h.mgr.admitted().len(), 1);

        let ios = h.drain();
        let dials = connects(&ios);
        let events = peer_events(ios);
        assert!(
            matches!(events.first(), Some(Event::Disconnected(addr, _)) if *addr == one),
            "expected a disconnect event for the dropped peer"
        );
        // Exactly one replacement attempt is made. The only configured
        // static peer is the one that just left, so the dial is observable.
        assert_eq!(dials, vec![one]);
    }

    #[tokio::test]
    async fn test_hard_limit_evicts_oldest() {
        let params = static_params(&["1.1.1.1:9000"]);
        let mut config = config(2);
        config.hard_limit = true;

        let mut h = Harness::new(params, config, MockExchange::new());
        let addrs: Vec<PeerId> = vec![
            "1.1.1.1:9000".parse().unwrap(),
            "2.2.2.2:9000".parse().unwrap(),
            "3.3.3.3:9000".parse().unwrap(),
        ];

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        for addr in &addrs {
            h.mgr.connect(addr, Source::Static);
            h.establish(*addr).await;
            assert!(h.mgr.admitted().len() <= 2);
        }

        // The oldest admitted peer was evicted.
        assert!(!h.mgr.is_admitted(&addrs[0]));
        assert!(h.mgr.is_admitted(&addrs[1]));
        assert!(h.mgr.is_admitted(&addrs[2]));

        let evicted = h.drain().into_iter().any(|io| {
            matches!(io, Io::Disconnect(addr, DisconnectReason::OverLimit) if addr == addrs[0])
        });
        assert!(evicted, "expected the oldest peer to be disconnected");
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_and_retries() {
        let params = static_params(&["1.1.1.1:9000"]);
        let mut h = Harness::new(params, config(1), MockExchange::new());
        let addr = "1.1.1.1:9000".parse().unwrap();

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        h.drain();

        h.elapse(DEFAULT_CONNECT_TIMEOUT);
        h.mgr.received_wake(&mut h.discovery, &mut h.exchange).await;

        let timed_out = h.drain().into_iter().any(|io| {
            matches!(io, Io::Disconnect(a, DisconnectReason::ConnectionTimeout) if a == addr)
        });
        assert!(timed_out, "expected the dial to time out");

        // The reactor reports the disconnect back; a single new attempt is made.
        h.mgr
            .peer_disconnected(
                &addr,
                &mut h.discovery,
                &mut h.exchange,
                NetDisconnect::StateMachine(DisconnectReason::ConnectionTimeout),
            )
            .await;

        let ios = h.drain();
        let dials = connects(&ios);
        let events = peer_events(ios);
        assert!(
            matches!(events.first(), Some(Event::ConnectionFailed(a, _)) if *a == addr),
            "expected a connection failure event"
        );
        assert_eq!(dials, vec![addr]);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let params = static_params(&["1.1.1.1:9000"]);
        let mut h = Harness::new(params, config(1), MockExchange::new());
        let addr: PeerId = "1.1.1.1:9000".parse().unwrap();

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        h.mgr.peer_connected(addr, ([127, 0, 0, 1], 1234).into(), Link::Outbound);
        h.drain();

        h.elapse(HANDSHAKE_TIMEOUT);
        h.mgr.received_wake(&mut h.discovery, &mut h.exchange).await;

        let timed_out = h.drain().into_iter().any(|io| {
            matches!(io, Io::Disconnect(a, DisconnectReason::PeerTimeout("handshake")) if a == addr)
        });
        assert!(timed_out, "expected the handshake to time out");
    }

    #[tokio::test]
    async fn test_self_connection_is_rejected() {
        let params = static_params(&["1.1.1.1:9000"]);
        let mut h = Harness::new(params, config(1), MockExchange::new());
        let addr: PeerId = "1.1.1.1:9000".parse().unwrap();

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        h.mgr.peer_connected(addr, ([127, 0, 0, 1], 1234).into(), Link::Outbound);

        // Grab the nonce we sent and echo it back in the remote's version.
        let nonce = h
            .drain()
            .into_iter()
            .find_map(|io| match io {
                Io::Write(_, msg) => match msg.payload {
                    bitcoin::network::message::NetworkMessage::Version(v) => Some(v.nonce),
                    _ => None,
                },
                _ => None,
            })
            .expect("a version message must have been sent");

        h.mgr.received_version(&addr, version_msg(nonce));

        let rejected = h.drain().into_iter().any(|io| {
            matches!(io, Io::Disconnect(a, DisconnectReason::SelfConnection) if a == addr)
        });
        assert!(rejected, "expected the self-connection to be dropped");
    }

    #[tokio::test]
    async fn test_close_disconnects_everything() {
        let params = static_params(&["1.1.1.1:9000", "2.2.2.2:9000"]);
        let mut h = Harness::new(params, config(2), MockExchange::new());
        let (one, two): (PeerId, PeerId) =
            ("1.1.1.1:9000".parse().unwrap(), "2.2.2.2:9000".parse().unwrap());

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;
        h.mgr.connect(&one, Source::Static);
        h.mgr.connect(&two, Source::Static);
        h.establish(one).await;
        h.establish(two).await;
        h.drain();

        assert_eq!(h.mgr.close(), 2);
        assert_eq!(h.mgr.phase(), Phase::Closed);

        let closing = h
            .drain()
            .into_iter()
            .filter(|io| matches!(io, Io::Disconnect(_, DisconnectReason::Closing)))
            .count();
        assert_eq!(closing, 2);

        // A discovery result arriving after close is destroyed.
        let late: PeerId = "3.3.3.3:9000".parse().unwrap();
        h.mgr.peer_connected(late, ([127, 0, 0, 1], 1234).into(), Link::Inbound);

        let destroyed = h.drain().into_iter().any(|io| {
            matches!(io, Io::Disconnect(a, DisconnectReason::Closing) if a == late)
        });
        assert!(destroyed, "late connections must be discarded");
    }

    #[tokio::test]
    async fn test_web_seeds_gate_the_fill() {
        let mut params = static_params(&["9.9.9.9:9000"]);
        params.web_seeds = vec![
            WebSeed::new("websocket", "seed0.example.com", 8192),
            WebSeed::new("websocket", "seed1.example.com", 8192),
            WebSeed::new("websocket", "seed2.example.com", 8192),
        ];

        let mut config = config(8);
        config.connect_web = true;

        let mut exchange = MockExchange::new();
        exchange.expect_peers().return_const(Vec::new());
        exchange
            .expect_connect()
            .times(3)
            .returning(|_, _, _| Ok(stream_pair()));

        let mut h = Harness::new(params, config, exchange);

        h.mgr.start(&mut h.discovery, &mut h.exchange).await;

        // Three seed sessions are handed to the reactor; the fill hasn't
        // started yet.
        let ios = h.drain();
        let adopted: Vec<PeerId> = ios
            .iter()
            .filter_map(|io| match io {
                Io::Adopt(addr, _, Link::Outbound) => Some(*addr),
                _ => None,
            })
            .collect();
        assert_eq!(adopted.len(), 3);
        assert!(connects(&ios).is_empty());

        // Two admissions keep the gate shut.
        h.establish(adopted[0]).await;
        h.establish(adopted[1]).await;
        assert!(connects(&h.drain()).is_empty());

        // The third admission opens it.
        h.establish(adopted[2]).await;
        assert_eq!(connects(&h.drain()), vec!["9.9.9.9:9000".parse().unwrap()]);
    }

    /// A connected localhost stream and its remote address.
    fn stream_pair() -> (std::net::TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();

        (stream, addr)
    }
}
