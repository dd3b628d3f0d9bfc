//! The peer-group state machine.
//!
//! Ties the managers together: dispatches wire messages, executes user
//! commands, and owns the group lifecycle from `connect()` to `close()`.
use std::{borrow::Cow, fmt, io, net, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::network::Magic;
use bitcoin::{BlockHash, Txid};
use flume as chan;
use thiserror::Error;
use tracing::{debug, trace};

use flock_types::Params;

use crate::common::exchange::{self, Exchange, TransportOpts};
use crate::common::peer::Peer;
use crate::common::time::SettableClock;
use crate::fsm::discovery::{Discovery, Producer};
use crate::fsm::event::Event;
use crate::fsm::invmgr::InventoryManager;
use crate::fsm::output::{self, Outbox};
use crate::fsm::peermgr::{self, PeerManager, Phase};
use crate::fsm::reqmgr::{BlockOpts, Blocks, HeaderOpts, RequestManager};
use crate::net::{Disconnect, Link, LocalDuration, LocalTime, StateMachine as NetStateMachine};

pub type PeerId = net::SocketAddr;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70016;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = concat!("/flock:", env!("CARGO_PKG_VERSION"), "/");

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old.
    PeerProtocolVersion(u32),
    /// Peer magic is invalid.
    PeerMagic(Magic),
    /// Peer timed out.
    PeerTimeout(&'static str),
    /// The connection could not be established in time.
    ConnectionTimeout,
    /// The peer failed to answer a request in time.
    RequestTimeout,
    /// The peer reported a fatal error.
    PeerError(Arc<io::Error>),
    /// Connection to self was detected.
    SelfConnection,
    /// The pool grew beyond its hard limit; the oldest peer makes room.
    OverLimit,
    /// The group is shutting down.
    Closing,
    /// Error trying to decode incoming message.
    DecodeError,
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer was disconnected for another reason.
    Other(&'static str),
}

impl DisconnectReason {
    /// Check whether the disconnect reason is transient, ie. may no longer be
    /// applicable after some time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout | Self::RequestTimeout | Self::PeerTimeout(_)
        )
    }
}

impl From<DisconnectReason> for crate::net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(_) => write!(f, "peer protocol version mismatch"),
            Self::PeerMagic(magic) => write!(f, "received message with invalid magic: {}", magic),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {:?}", s),
            Self::ConnectionTimeout => write!(f, "Connection timed out"),
            Self::RequestTimeout => write!(f, "request timed out"),
            Self::PeerError(err) => write!(f, "peer error: {}", err),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::OverLimit => write!(f, "PeerGroup over limit"),
            Self::Closing => write!(f, "PeerGroup closing"),
            Self::DecodeError => write!(f, "message decode error"),
            Self::Command => write!(f, "received external command"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// A failure reported to the caller of a group operation.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// The operation requires at least one admitted peer.
    #[error("Not connected to any peers")]
    NotConnected,
    /// Outbound connections were requested on a bridge.
    #[error("Do not use connect() with Bridge, only incoming connections are allowed")]
    BridgeOutbound,
}

/// Group configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network parameters.
    pub params: Params,
    /// Target number of admitted peers.
    pub target_peers: usize,
    /// Evict the oldest peer instead of growing beyond the target.
    pub hard_limit: bool,
    /// Time to wait for a new connection to be established.
    pub connect_timeout: LocalDuration,
    /// Whether exchange-based (web) connectivity is enabled.
    pub connect_web: bool,
    /// Protocol version.
    pub protocol_version: u32,
    /// Services offered by our peer.
    pub services: ServiceFlags,
    /// Our user agent.
    pub user_agent: &'static str,
}

impl Config {
    /// Create a configuration for the given network parameters.
    pub fn new(params: Params) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    fn peer_config(&self) -> peermgr::Config {
        peermgr::Config {
            target_peers: self.target_peers,
            hard_limit: self.hard_limit,
            connect_timeout: self.connect_timeout,
            connect_web: self.connect_web,
            protocol_version: self.protocol_version,
            services: self.services,
            user_agent: self.user_agent,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            params: Params::default(),
            target_peers: peermgr::DEFAULT_TARGET_PEERS,
            hard_limit: false,
            connect_timeout: peermgr::DEFAULT_CONNECT_TIMEOUT,
            connect_web: false,
            protocol_version: PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            user_agent: USER_AGENT,
        }
    }
}

/// A command or request that can be sent to the group.
#[derive(Clone)]
pub enum Command {
    /// Start maintaining the peer pool.
    Connect,
    /// Shut the group down. The reply fires once the admitted-peer list
    /// reaches zero.
    Close(chan::Sender<()>),
    /// Start accepting inbound exchange peers on the given port.
    Accept(Option<u16>, chan::Sender<Result<(), ExchangeError>>),
    /// Stop accepting inbound exchange peers.
    Unaccept(chan::Sender<Result<(), ExchangeError>>),
    /// Broadcast a message to every admitted peer. The flag asserts that at
    /// least one peer is connected.
    Broadcast(NetworkMessage, bool, chan::Sender<Result<Vec<PeerId>, CommandError>>),
    /// Get the admitted peers.
    GetPeers(chan::Sender<Vec<Peer>>),
    /// Get a random admitted peer.
    RandomPeer(chan::Sender<Result<Peer, CommandError>>),
    /// Request blocks by hash.
    GetBlocks(
        Vec<BlockHash>,
        BlockOpts,
        chan::Sender<Result<(Blocks, PeerId), CommandError>>,
    ),
    /// Request transactions by id. The block hash, when known, is carried
    /// for the caller's own bookkeeping.
    GetTransactions(
        Option<BlockHash>,
        Vec<Txid>,
        chan::Sender<Result<(Vec<bitcoin::Transaction>, PeerId), CommandError>>,
    ),
    /// Request headers starting from a locator.
    GetHeaders(
        Vec<BlockHash>,
        HeaderOpts,
        chan::Sender<Result<(Vec<bitcoin::block::Header>, PeerId), CommandError>>,
    ),
}

/// Alias so `Command` stays readable.
pub type ExchangeError = exchange::Error;

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "Connect"),
            Self::Close(_) => write!(f, "Close"),
            Self::Accept(port, _) => write!(f, "Accept({:?})", port),
            Self::Unaccept(_) => write!(f, "Unaccept"),
            Self::Broadcast(msg, assert, _) => {
                write!(f, "Broadcast({:?}, assert = {})", msg.cmd(), assert)
            }
            Self::GetPeers(_) => write!(f, "GetPeers"),
            Self::RandomPeer(_) => write!(f, "RandomPeer"),
            Self::GetBlocks(hashes, opts, _) => write!(f, "GetBlocks({:?}, {:?})", hashes, opts),
            Self::GetTransactions(block, txids, _) => {
                write!(f, "GetTransactions({:?}, {:?})", block, txids)
            }
            Self::GetHeaders(locator, opts, _) => {
                write!(f, "GetHeaders({:?}, {:?})", locator, opts)
            }
        }
    }
}

/// An instance of the peer-group protocol.
pub struct StateMachine<E, C> {
    /// Group configuration.
    pub config: Config,
    /// Peer manager.
    pub peermgr: PeerManager<Outbox, C>,
    /// Transaction inventory pool.
    invmgr: InventoryManager<Outbox>,
    /// Request dispatcher.
    reqmgr: RequestManager<Outbox, C>,
    /// Peer discovery.
    discovery: Discovery,
    /// Peer-exchange handle.
    exchange: E,
    /// Whether inbound exchange peers are being accepted.
    accepting: bool,
    /// Pending `close` completion.
    closing: Option<chan::Sender<()>>,
    clock: C,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    pub outbox: Outbox,
}

impl<E: Exchange, C: SettableClock + Sync + Send> StateMachine<E, C> {
    /// Construct a new protocol instance.
    pub fn new(
        config: Config,
        exchange: E,
        producer: Option<Box<dyn Producer>>,
        rng: fastrand::Rng,
        clock: C,
    ) -> Self {
        let outbox = Outbox::new(config.params.magic);
        let discovery = Discovery::new(
            config.params.clone(),
            config.connect_web,
            producer,
            rng.clone(),
        );
        let peermgr = PeerManager::new(
            config.peer_config(),
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let invmgr = InventoryManager::new(outbox.clone());
        let reqmgr = RequestManager::new(rng, outbox.clone(), clock.clone());

        Self {
            config,
            peermgr,
            invmgr,
            reqmgr,
            discovery,
            exchange,
            accepting: false,
            closing: None,
            clock,
            outbox,
        }
    }

    /// Whether inbound exchange peers are currently accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.peermgr.disconnect(addr, reason);
    }

    /// The transaction inventory pool, for inspection.
    pub fn inventory(&self) -> &InventoryManager<Outbox> {
        &self.invmgr
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::Connect => {
                self.peermgr
                    .start(&mut self.discovery, &mut self.exchange)
                    .await;
            }
            Command::Close(reply) => {
                self.close(reply).await;
            }
            Command::Accept(port, reply) => {
                let result = self.accept(port).await;
                reply.send_async(result).await.ok();
            }
            Command::Unaccept(reply) => {
                let result = self.unaccept().await;
                reply.send_async(result).await.ok();
            }
            Command::Broadcast(msg, assert, reply) => {
                let result = self.broadcast(msg, assert);
                reply.send_async(result).await.ok();
            }
            Command::GetPeers(reply) => {
                reply.send_async(self.peermgr.peers()).await.ok();
            }
            Command::RandomPeer(reply) => {
                let result = self.random_peer().ok_or(CommandError::NotConnected);
                reply.send_async(result).await.ok();
            }
            Command::GetBlocks(hashes, opts, reply) => {
                let peers = self.peermgr.admitted().to_vec();
                self.reqmgr.get_blocks(hashes, opts, &peers, reply);
            }
            Command::GetTransactions(_block_hash, txids, reply) => {
                let peers = self.peermgr.admitted().to_vec();
                self.reqmgr.get_transactions(txids, &peers, reply);
            }
            Command::GetHeaders(locator, opts, reply) => {
                let peers = self.peermgr.admitted().to_vec();
                self.reqmgr.get_headers(locator, opts, &peers, reply);
            }
        }
    }

    /// Send a message to every admitted peer.
    fn broadcast(
        &mut self,
        msg: NetworkMessage,
        assert: bool,
    ) -> Result<Vec<PeerId>, CommandError> {
        let peers = self.peermgr.admitted().to_vec();

        if peers.is_empty() {
            if assert {
                return Err(CommandError::NotConnected);
            }
            return Ok(peers);
        }
        for addr in &peers {
            self.outbox.message(*addr, msg.clone());
        }

        Ok(peers)
    }

    /// A random admitted peer.
    fn random_peer(&mut self) -> Option<Peer> {
        let addr = self.peermgr.random_peer()?;

        self.peermgr.peers().into_iter().find(|p| p.addr == addr)
    }

    /// Enable inbound exchange acceptance.
    async fn accept(&mut self, port: Option<u16>) -> Result<(), ExchangeError> {
        let opts = TransportOpts {
            port: port.unwrap_or(self.config.params.default_web_port),
        };

        exchange::enable_accept(&mut self.exchange, opts).await?;
        self.accepting = true;

        Ok(())
    }

    /// Disable inbound exchange acceptance. A no-op when not accepting.
    async fn unaccept(&mut self) -> Result<(), ExchangeError> {
        if !self.accepting {
            return Ok(());
        }
        self.accepting = false;

        exchange::disable_accept(&mut self.exchange).await
    }

    /// Shut the group down.
    async fn close(&mut self, reply: chan::Sender<()>) {
        self.invmgr.stop();
        self.unaccept().await.ok();
        self.reqmgr.close();

        let admitted = self.peermgr.close();

        if admitted == 0 {
            reply.send_async(()).await.ok();
        } else {
            self.closing = Some(reply);
        }
    }
}

impl<E, C> Iterator for StateMachine<E, C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

#[async_trait]
impl<E: Exchange + Send + Sync, C: SettableClock + Sync + Send> NetStateMachine
    for StateMachine<E, C>
{
    type Message = RawNetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.outbox.event(Event::Ready { time });
    }

    async fn message_received(&mut self, addr: &SocketAddr, msg: Cow<'_, RawNetworkMessage>) {
        let addr = *addr;
        let msg = msg.into_owned();

        if msg.magic != self.config.params.magic {
            self.peermgr
                .disconnect(addr, DisconnectReason::PeerMagic(msg.magic));
            return;
        }
        debug!(target: "p2p", "Received {:?} from {}", msg.payload.cmd(), addr);

        let payload = msg.payload;

        // Admitted-peer traffic is re-emitted on the group as a whole.
        if self.peermgr.is_admitted(&addr) {
            self.outbox.event(Event::Message {
                addr,
                msg: payload.clone(),
            });
        }

        match payload {
            NetworkMessage::Version(version) => {
                self.peermgr.received_version(&addr, version);
            }
            NetworkMessage::Verack => {
                let admitted = self
                    .peermgr
                    .received_verack(&addr, &mut self.discovery, &mut self.exchange)
                    .await;

                if admitted.is_some() {
                    // The inventory pool ages entries from the first
                    // admission onwards.
                    self.invmgr.start(self.clock.local_time());
                }
            }
            NetworkMessage::Ping(nonce) => {
                self.outbox.message(addr, NetworkMessage::Pong(nonce));
            }
            NetworkMessage::Pong(_) => {}
            NetworkMessage::Block(block) => {
                self.reqmgr.received_block(&addr, &block);

                if self.peermgr.is_admitted(&addr) {
                    self.outbox.event(Event::Block { addr, block });
                }
            }
            NetworkMessage::MerkleBlock(merkle_block) => {
                self.reqmgr.received_merkle_block(&addr, &merkle_block);

                if self.peermgr.is_admitted(&addr) {
                    self.outbox.event(Event::MerkleBlock { addr, merkle_block });
                }
            }
            NetworkMessage::Tx(tx) => {
                self.reqmgr.received_tx(&addr, &tx);

                if self.peermgr.is_admitted(&addr) && self.invmgr.insert(&tx) {
                    self.outbox.event(Event::Tx { addr, tx });
                }
            }
            NetworkMessage::Headers(headers) => {
                self.reqmgr.received_headers(&addr, &headers);
            }
            _ => {
                // Served by no manager; consumers see it via `Event::Message`.
                trace!(target: "p2p", "Unhandled message from {}", addr);
            }
        }
    }

    fn attempted(&mut self, addr: &SocketAddr) {
        trace!(target: "p2p", "{}: Connection attempt underway", addr);
    }

    fn connected(&mut self, addr: SocketAddr, local_addr: &SocketAddr, link: Link) {
        self.peermgr.peer_connected(addr, *local_addr, link);
    }

    async fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        // An admitted peer failing with a connection error surfaces as a
        // peer error before the disconnect itself.
        if self.peermgr.is_admitted(addr) {
            if let Some(error) = reason.io_error() {
                self.outbox.event(Event::PeerError {
                    addr: *addr,
                    error: error.clone(),
                });
            }
        }

        // Requests in flight on this peer move elsewhere before the peer
        // list shrinks.
        let remaining = self
            .peermgr
            .admitted()
            .iter()
            .copied()
            .filter(|a| a != addr)
            .collect::<Vec<_>>();
        self.reqmgr.peer_disconnected(addr, &remaining);

        self.peermgr
            .peer_disconnected(addr, &mut self.discovery, &mut self.exchange, reason)
            .await;

        if self.peermgr.admitted().is_empty() {
            if let Some(reply) = self.closing.take() {
                reply.send_async(()).await.ok();
            }
        }
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);

        // Inbound peers surfaced by the exchange enter the normal admission
        // path; after close their transports are simply dropped.
        while let Some((stream, addr)) = self.exchange.incoming() {
            if self.peermgr.phase() == Phase::Closed {
                continue;
            }
            self.outbox.push(output::Io::Adopt(addr, stream, Link::Inbound));
        }
    }

    async fn timer_expired(&mut self) {
        trace!("Received wake");

        self.peermgr
            .received_wake(&mut self.discovery, &mut self.exchange)
            .await;
        self.invmgr.received_wake(self.clock.local_time());

        let peers = self.peermgr.admitted().to_vec();
        self.reqmgr.received_wake(&peers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::network::address::Address;
    use bitcoin::network::message_network::VersionMessage;

    use flock_types::Network;

    use crate::common::exchange::{MockExchange, TRANSPORT_WEBRTC, TRANSPORT_WEBSOCKET};
    use crate::common::time::RefClock;
    use crate::fsm::peermgr::Event as PeerEvent;

    type Machine = StateMachine<MockExchange, RefClock>;

    fn machine(exchange: MockExchange) -> Machine {
        tracing_subscriber::fmt().try_init().ok();

        StateMachine::new(
            Config::new(Params::new(Network::Regtest)),
            exchange,
            None,
            fastrand::Rng::with_seed(3),
            RefClock::from(LocalTime::from_secs(100_000)),
        )
    }

    fn raw(payload: NetworkMessage) -> RawNetworkMessage {
        RawNetworkMessage {
            magic: Network::Regtest.magic(),
            payload,
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

    /// Drive an inbound peer through the handshake until admission.
    async fn admit(machine: &mut Machine, addr: PeerId, nonce: u64) {
        machine.connected(addr, &([127, 0, 0, 1], 1234).into(), Link::Inbound);
        machine
            .message_received(&addr, Cow::Owned(raw(NetworkMessage::Version(version_msg(nonce)))))
            .await;
        machine
            .message_received(&addr, Cow::Owned(raw(NetworkMessage::Verack)))
            .await;
        assert!(machine.peermgr.is_admitted(&addr));
    }

    fn drain(machine: &mut Machine) -> Vec<output::Io> {
        machine.by_ref().collect()
    }

    fn tx(n: u32) -> bitcoin::Transaction {
        use bitcoin::absolute::LockTime;
        use bitcoin::{ScriptBuf, TxOut};

        bitcoin::Transaction {
            version: 2,
            lock_time: LockTime::from_consensus(n),
            input: vec![],
            output: vec![TxOut {
                value: u64::from(n),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_send_asserts_at_least_one_peer() {
        let mut machine = machine(MockExchange::new());
        let (reply, recv) = chan::bounded(1);

        machine
            .command(Command::Broadcast(NetworkMessage::GetAddr, true, reply))
            .await;

        let err = recv.recv().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Not connected to any peers");

        // Without the assertion the call is a quiet no-op.
        let (reply, recv) = chan::bounded(1);
        machine
            .command(Command::Broadcast(NetworkMessage::GetAddr, false, reply))
            .await;
        assert!(recv.recv().unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_admitted_peer() {
        let mut machine = machine(MockExchange::new());
        let peers: Vec<PeerId> = vec![
            "10.0.0.1:8333".parse().unwrap(),
            "10.0.0.2:8333".parse().unwrap(),
            "10.0.0.3:8333".parse().unwrap(),
        ];

        for (i, addr) in peers.iter().enumerate() {
            admit(&mut machine, *addr, i as u64 + 1).await;
        }
        drain(&mut machine);

        let (reply, recv) = chan::bounded(1);
        machine
            .command(Command::Broadcast(NetworkMessage::GetAddr, true, reply))
            .await;
        let sent = recv.recv().unwrap().unwrap();
        assert_eq!(sent.len(), 3);

        let writes = drain(&mut machine)
            .into_iter()
            .filter_map(|io| match io {
                output::Io::Write(addr, msg) => Some((addr, msg.payload)),
                _ => None,
            })
            .filter(|(_, payload)| matches!(payload, NetworkMessage::GetAddr))
            .map(|(addr, _)| addr)
            .collect::<Vec<_>>();

        for addr in &peers {
            assert!(writes.contains(addr), "{} did not receive the broadcast", addr);
        }
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let mut machine = machine(MockExchange::new());
        let addr: PeerId = "10.0.0.1:8333".parse().unwrap();

        admit(&mut machine, addr, 1).await;
        drain(&mut machine);

        machine
            .message_received(&addr, Cow::Owned(raw(NetworkMessage::Ping(42))))
            .await;

        let answered = drain(&mut machine).into_iter().any(|io| {
            matches!(
                io,
                output::Io::Write(a, msg)
                    if a == addr && matches!(msg.payload, NetworkMessage::Pong(42))
            )
        });
        assert!(answered, "expected a pong");
    }

    #[tokio::test]
    async fn test_first_tx_observation_emits_event() {
        let mut machine = machine(MockExchange::new());
        let (one, two): (PeerId, PeerId) =
            ("10.0.0.1:8333".parse().unwrap(), "10.0.0.2:8333".parse().unwrap());

        admit(&mut machine, one, 1).await;
        admit(&mut machine, two, 2).await;
        drain(&mut machine);

        let tx = tx(7);
        machine
            .message_received(&one, Cow::Owned(raw(NetworkMessage::Tx(tx.clone()))))
            .await;

        let events = drain(&mut machine);
        assert!(events.iter().any(|io| matches!(io, output::Io::Event(Event::Tx { .. }))));
        assert!(machine.inventory().contains(&tx.txid()));

        // The same transaction from another peer is absorbed silently.
        machine
            .message_received(&two, Cow::Owned(raw(NetworkMessage::Tx(tx.clone()))))
            .await;

        let events = drain(&mut machine);
        assert!(
            !events.iter().any(|io| matches!(io, output::Io::Event(Event::Tx { .. }))),
            "a duplicate observation must not re-emit"
        );
        // It still surfaces as a generic message.
        assert!(events.iter().any(|io| matches!(io, output::Io::Event(Event::Message { .. }))));
    }

    #[tokio::test]
    async fn test_accept_downgrades_missing_webrtc() {
        let mut exchange = MockExchange::new();
        exchange
            .expect_accept()
            .withf(|transport, _| transport == TRANSPORT_WEBSOCKET)
            .returning(|_, _| Ok(()));
        exchange
            .expect_accept()
            .withf(|transport, _| transport == TRANSPORT_WEBRTC)
            .returning(|t, _| Err(ExchangeError::TransportNotFound(t.to_owned())));

        let mut machine = machine(exchange);
        let (reply, recv) = chan::bounded(1);

        machine.command(Command::Accept(None, reply)).await;

        assert!(recv.recv().unwrap().is_ok());
        assert!(machine.is_accepting());
    }

    #[tokio::test]
    async fn test_accept_rolls_back_on_webrtc_failure() {
        let mut exchange = MockExchange::new();
        exchange
            .expect_accept()
            .withf(|transport, _| transport == TRANSPORT_WEBSOCKET)
            .returning(|_, _| Ok(()));
        exchange
            .expect_accept()
            .withf(|transport, _| transport == TRANSPORT_WEBRTC)
            .returning(|_, _| Err(ExchangeError::Other("signalling down".to_owned())));
        exchange
            .expect_unaccept()
            .withf(|transport| transport == TRANSPORT_WEBSOCKET)
            .times(1)
            .returning(|_| Ok(()));

        let mut machine = machine(exchange);
        let (reply, recv) = chan::bounded(1);

        machine.command(Command::Accept(Some(9000), reply)).await;

        assert!(recv.recv().unwrap().is_err());
        assert!(!machine.is_accepting());
    }

    #[tokio::test]
    async fn test_unaccept_is_a_noop_when_not_accepting() {
        let mut machine = machine(MockExchange::new());
        let (reply, recv) = chan::bounded(1);

        machine.command(Command::Unaccept(reply)).await;
        assert!(recv.recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_completes_once_pool_is_empty() {
        let mut machine = machine(MockExchange::new());
        let addr: PeerId = "10.0.0.1:8333".parse().unwrap();

        admit(&mut machine, addr, 1).await;

        let (reply, recv) = chan::bounded(1);
        machine.command(Command::Close(reply)).await;

        // The admitted peer hasn't finished disconnecting yet.
        assert!(recv.try_recv().is_err());

        machine
            .disconnected(
                &addr,
                Disconnect::StateMachine(DisconnectReason::Closing),
            )
            .await;

        recv.recv().expect("close must complete");
    }

    #[tokio::test]
    async fn test_close_with_empty_pool_completes_immediately() {
        let mut machine = machine(MockExchange::new());
        let (reply, recv) = chan::bounded(1);

        machine.command(Command::Close(reply)).await;
        recv.recv().expect("close must complete");
    }

    #[tokio::test]
    async fn test_random_peer_requires_a_peer() {
        let mut machine = machine(MockExchange::new());
        let (reply, recv) = chan::bounded(1);

        machine.command(Command::RandomPeer(reply)).await;
        assert!(matches!(
            recv.recv().unwrap(),
            Err(CommandError::NotConnected)
        ));

        let addr: PeerId = "10.0.0.1:8333".parse().unwrap();
        admit(&mut machine, addr, 1).await;

        let (reply, recv) = chan::bounded(1);
        machine.command(Command::RandomPeer(reply)).await;
        assert_eq!(recv.recv().unwrap().unwrap().addr, addr);
    }

    #[tokio::test]
    async fn test_wrong_magic_disconnects() {
        let mut machine = machine(MockExchange::new());
        let addr: PeerId = "10.0.0.1:8333".parse().unwrap();

        admit(&mut machine, addr, 1).await;
        drain(&mut machine);

        machine
            .message_received(
                &addr,
                Cow::Owned(RawNetworkMessage {
                    magic: Network::Bitcoin.magic(),
                    payload: NetworkMessage::GetAddr,
                }),
            )
            .await;

        let disconnected = drain(&mut machine).into_iter().any(|io| {
            matches!(io, output::Io::Disconnect(a, DisconnectReason::PeerMagic(_)) if a == addr)
        });
        assert!(disconnected);
    }

    #[tokio::test]
    async fn test_admission_emits_peer_event() {
        let mut machine = machine(MockExchange::new());
        let addr: PeerId = "10.0.0.1:8333".parse().unwrap();

        admit(&mut machine, addr, 1).await;

        let negotiated = drain(&mut machine).into_iter().any(|io| {
            matches!(
                io,
                output::Io::Event(Event::Peer(PeerEvent::Negotiated { addr: a, .. })) if a == addr
            )
        });
        assert!(negotiated, "admission must surface as a peer event");
    }
}
