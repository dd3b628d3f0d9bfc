//! Bridge controller.
//!
//! A bridge never maintains a pool of its own. Each inbound exchange client
//! is paired with one freshly dialed outbound peer, and from then on the two
//! byte streams are spliced verbatim until either side goes away. The pair
//! owns both endpoints, so tearing one down always tears down the other
//! exactly once.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use flume as chan;
use tracing::{debug, trace};

use crate::common::exchange::{self, Exchange, TransportOpts};
use crate::common::time::SettableClock;
use crate::fsm::discovery::{Candidate, Discovery};
use crate::fsm::handler::{Command, CommandError, Config, DisconnectReason, PeerId};
use crate::fsm::event::Event as GroupEvent;
use crate::net::{Disconnect, Link, LocalDuration, LocalTime, StateMachine as NetStateMachine};

/// How often the exchange is polled for inbound clients.
pub const INCOMING_POLL_INTERVAL: LocalDuration = LocalDuration::from_secs(1);
/// Time to wait before re-attempting a failed outbound pairing.
pub const RETRY_DELAY: LocalDuration = LocalDuration::from_secs(1);

/// Bridge I/O instructions: raw bytes, no protocol framing.
pub type Io = crate::net::Io<Vec<u8>, GroupEvent, DisconnectReason>;

/// An event originating in the bridge controller.
#[derive(Debug, Clone)]
pub enum Event {
    /// An inbound client arrived and is being paired.
    Connection(PeerId),
    /// An outbound pairing attempt failed; it will be retried.
    ConnectError(Arc<io::Error>),
    /// A pair is spliced: bytes now flow in both directions.
    Bridged {
        /// The inbound client.
        client: PeerId,
        /// Its outbound counterpart.
        peer: PeerId,
    },
    /// One endpoint of a spliced pair failed; both were destroyed.
    PeerError {
        /// What went wrong.
        error: Arc<io::Error>,
        /// The inbound client.
        client: PeerId,
        /// Its outbound counterpart.
        peer: PeerId,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(addr) => write!(fmt, "{}: Inbound bridge client", addr),
            Self::ConnectError(err) => write!(fmt, "Bridge pairing attempt failed: {}", err),
            Self::Bridged { client, peer } => write!(fmt, "Bridged {} <-> {}", client, peer),
            Self::PeerError { error, client, peer } => {
                write!(fmt, "Bridge {} <-> {} failed: {}", client, peer, error)
            }
        }
    }
}

/// State of an inbound client.
#[derive(Debug)]
enum ClientState {
    /// Waiting for its outbound counterpart. Bytes received meanwhile are
    /// buffered and flushed on splice.
    Pairing {
        outbound: Option<PeerId>,
        buffered: Vec<u8>,
    },
    /// Spliced with an outbound peer.
    Spliced { peer: PeerId },
}

/// State of an outbound counterpart.
#[derive(Debug)]
struct Outbound {
    client: PeerId,
    /// Set while the dial is in flight; cleared on splice.
    dialing: Option<LocalTime>,
}

/// The bridge state machine. Replaces the pool replenisher entirely:
/// outbound connections exist only as counterparts of inbound clients.
pub struct BridgeMachine<E, C> {
    /// Bridge configuration.
    pub config: Config,
    discovery: Discovery,
    exchange: E,
    accepting: bool,
    closed: bool,
    closing: Option<chan::Sender<()>>,
    clients: HashMap<PeerId, ClientState>,
    outbounds: HashMap<PeerId, Outbound>,
    clock: C,
    queue: VecDeque<Io>,
}

impl<E: Exchange, C: SettableClock + Sync + Send> BridgeMachine<E, C> {
    /// Construct a new bridge.
    pub fn new(mut config: Config, exchange: E, rng: fastrand::Rng, clock: C) -> Self {
        // A bridge serves web clients from native connectivity; it never
        // draws its outbound peers from the exchange.
        config.connect_web = false;

        let discovery = Discovery::new(config.params.clone(), false, None, rng);

        Self {
            config,
            discovery,
            exchange,
            accepting: false,
            closed: false,
            closing: None,
            clients: HashMap::new(),
            outbounds: HashMap::new(),
            clock,
            queue: VecDeque::new(),
        }
    }

    /// Whether inbound exchange clients are currently accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Number of spliced pairs.
    pub fn bridged(&self) -> usize {
        self.clients
            .values()
            .filter(|c| matches!(c, ClientState::Spliced { .. }))
            .count()
    }

    fn push(&mut self, io: Io) {
        self.queue.push_back(io);
    }

    fn event(&mut self, event: Event) {
        debug!(target: "p2p", "{}", &event);
        self.queue.push_back(Io::Event(event.into()));
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::Connect => {
                // Outbound connections only ever happen as counterparts of
                // inbound clients.
                self.push(Io::Event(GroupEvent::Error(Arc::new(
                    CommandError::BridgeOutbound,
                ))));
            }
            Command::Close(reply) => {
                self.close(reply).await;
            }
            Command::Accept(port, reply) => {
                let opts = TransportOpts {
                    port: port.unwrap_or(self.config.params.default_web_port),
                };
                let result = exchange::enable_accept(&mut self.exchange, opts).await;

                if result.is_ok() {
                    self.accepting = true;
                }
                reply.send_async(result).await.ok();
            }
            Command::Unaccept(reply) => {
                let result = if self.accepting {
                    self.accepting = false;
                    exchange::disable_accept(&mut self.exchange).await
                } else {
                    Ok(())
                };
                reply.send_async(result).await.ok();
            }
            Command::Broadcast(_, assert, reply) => {
                let result = if assert {
                    Err(CommandError::NotConnected)
                } else {
                    Ok(Vec::new())
                };
                reply.send_async(result).await.ok();
            }
            Command::GetPeers(reply) => {
                reply.send_async(Vec::new()).await.ok();
            }
            Command::RandomPeer(reply) => {
                reply.send_async(Err(CommandError::NotConnected)).await.ok();
            }
            Command::GetBlocks(_, _, reply) => {
                reply.send_async(Err(CommandError::NotConnected)).await.ok();
            }
            Command::GetTransactions(_, _, reply) => {
                reply.send_async(Err(CommandError::NotConnected)).await.ok();
            }
            Command::GetHeaders(_, _, reply) => {
                reply.send_async(Err(CommandError::NotConnected)).await.ok();
            }
        }
    }

    /// Pull accepted clients off the exchange and start pairing them.
    async fn drain_incoming(&mut self) {
        while let Some((stream, addr)) = self.exchange.incoming() {
            if self.closed {
                // Clients arriving after close are discarded.
                continue;
            }
            self.event(Event::Connection(addr));
            self.clients.insert(
                addr,
                ClientState::Pairing {
                    outbound: None,
                    buffered: Vec::new(),
                },
            );
            self.push(Io::Adopt(addr, stream, Link::Inbound));
            self.request_outbound(addr).await;
        }
    }

    /// Draw one outbound candidate for a waiting client.
    async fn request_outbound(&mut self, client: PeerId) {
        let now = self.clock.local_time();

        match self.discovery.candidate(&mut self.exchange).await {
            Ok(Candidate::Dial(addr, _source)) => {
                if self.outbounds.contains_key(&addr) || self.clients.contains_key(&addr) {
                    // The candidate is already in use by another pair; try
                    // again on the next wake.
                    self.push(Io::SetTimer(RETRY_DELAY));
                    return;
                }
                self.outbounds.insert(
                    addr,
                    Outbound {
                        client,
                        dialing: Some(now),
                    },
                );
                if let Some(ClientState::Pairing { outbound, .. }) = self.clients.get_mut(&client)
                {
                    *outbound = Some(addr);
                }
                self.push(Io::Connect(addr));
                self.push(Io::SetTimer(self.config.connect_timeout));
            }
            Ok(Candidate::Stream(stream, addr, _source)) => {
                if self.outbounds.contains_key(&addr) || self.clients.contains_key(&addr) {
                    self.push(Io::SetTimer(RETRY_DELAY));
                    return;
                }
                self.outbounds.insert(
                    addr,
                    Outbound {
                        client,
                        dialing: Some(now),
                    },
                );
                if let Some(ClientState::Pairing { outbound, .. }) = self.clients.get_mut(&client)
                {
                    *outbound = Some(addr);
                }
                self.push(Io::Adopt(addr, stream, Link::Outbound));
            }
            Err(err) => {
                self.event(Event::ConnectError(Arc::new(io::Error::new(
                    io::ErrorKind::Other,
                    err.to_string(),
                ))));
                self.push(Io::SetTimer(RETRY_DELAY));
            }
        }
    }

    /// Splice a freshly connected outbound peer with its waiting client.
    fn splice(&mut self, addr: PeerId) {
        let Some(outbound) = self.outbounds.get_mut(&addr) else {
            return;
        };
        outbound.dialing = None;
        let client = outbound.client;

        match self.clients.get_mut(&client) {
            Some(ClientState::Spliced { .. }) => {}
            Some(state) => {
                let buffered = match state {
                    ClientState::Pairing { buffered, .. } => std::mem::take(buffered),
                    ClientState::Spliced { .. } => Vec::new(),
                };
                *state = ClientState::Spliced { peer: addr };

                if !buffered.is_empty() {
                    self.push(Io::Write(addr, buffered));
                }
                self.event(Event::Bridged { client, peer: addr });
            }
            None => {
                // The client went away while we were dialing.
                self.outbounds.remove(&addr);
                self.push(Io::Disconnect(
                    addr,
                    DisconnectReason::Other("bridge client closed"),
                ));
            }
        }
    }

    /// Tear down the counterpart of a gone endpoint. Idempotent: once a pair
    /// is gone, nothing fires anymore.
    async fn teardown(&mut self, addr: &PeerId, reason: Disconnect<DisconnectReason>) {
        if let Some(outbound) = self.outbounds.remove(addr) {
            let client = outbound.client;

            if outbound.dialing.is_some() {
                // The outbound attempt failed before the splice: retry from
                // the same inbound client.
                let err = match reason.io_error() {
                    Some(err) => err.clone(),
                    None => Arc::new(io::Error::new(io::ErrorKind::TimedOut, reason.to_string())),
                };
                self.event(Event::ConnectError(err));

                if let Some(ClientState::Pairing { outbound, .. }) =
                    self.clients.get_mut(&client)
                {
                    *outbound = None;
                }
                if !self.closed && self.clients.contains_key(&client) {
                    self.request_outbound(client).await;
                }
            } else {
                if let Some(err) = reason.io_error() {
                    self.event(Event::PeerError {
                        error: err.clone(),
                        client,
                        peer: *addr,
                    });
                }
                self.clients.remove(&client);
                self.push(Io::Disconnect(
                    client,
                    DisconnectReason::Other("bridge peer closed"),
                ));
            }
        } else if let Some(state) = self.clients.remove(addr) {
            match state {
                ClientState::Spliced { peer } => {
                    if let Some(err) = reason.io_error() {
                        self.event(Event::PeerError {
                            error: err.clone(),
                            client: *addr,
                            peer,
                        });
                    }
                    self.outbounds.remove(&peer);
                    self.push(Io::Disconnect(
                        peer,
                        DisconnectReason::Other("bridge client closed"),
                    ));
                }
                ClientState::Pairing {
                    outbound: Some(peer),
                    ..
                } => {
                    self.outbounds.remove(&peer);
                    self.push(Io::Disconnect(
                        peer,
                        DisconnectReason::Other("bridge client closed"),
                    ));
                }
                ClientState::Pairing { outbound: None, .. } => {}
            }
        }

        if self.closing.is_some() && self.clients.is_empty() && self.outbounds.is_empty() {
            if let Some(reply) = self.closing.take() {
                reply.send_async(()).await.ok();
            }
        }
    }

    /// Shut the bridge down.
    async fn close(&mut self, reply: chan::Sender<()>) {
        self.closed = true;

        if self.accepting {
            self.accepting = false;
            exchange::disable_accept(&mut self.exchange).await.ok();
        }

        if self.clients.is_empty() && self.outbounds.is_empty() {
            reply.send_async(()).await.ok();
            return;
        }
        self.closing = Some(reply);

        let endpoints = self
            .clients
            .keys()
            .chain(self.outbounds.keys())
            .copied()
            .collect::<Vec<_>>();
        for addr in endpoints {
            self.push(Io::Disconnect(addr, DisconnectReason::Closing));
        }
    }
}

impl<E, C> Iterator for BridgeMachine<E, C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.pop_front()
    }
}

#[async_trait]
impl<E: Exchange + Send + Sync, C: SettableClock + Sync + Send> NetStateMachine
    for BridgeMachine<E, C>
{
    type Message = [u8];
    type Event = GroupEvent;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.push(Io::Event(GroupEvent::Initializing));
        self.push(Io::Event(GroupEvent::Ready { time }));
        self.push(Io::SetTimer(INCOMING_POLL_INTERVAL));
    }

    async fn message_received(&mut self, addr: &PeerId, message: std::borrow::Cow<'_, [u8]>) {
        let bytes = message.into_owned();

        match self.clients.get_mut(addr) {
            Some(ClientState::Spliced { peer }) => {
                let peer = *peer;
                self.push(Io::Write(peer, bytes));
            }
            Some(ClientState::Pairing { buffered, .. }) => {
                buffered.extend(bytes);
            }
            None => {
                if let Some(outbound) = self.outbounds.get(addr) {
                    let client = outbound.client;
                    self.push(Io::Write(client, bytes));
                } else {
                    trace!(target: "p2p", "{}: Bytes from unknown endpoint dropped", addr);
                }
            }
        }
    }

    fn attempted(&mut self, addr: &PeerId) {
        trace!(target: "p2p", "{}: Bridge counterpart dial underway", addr);
    }

    fn connected(&mut self, addr: SocketAddr, _local_addr: &SocketAddr, link: Link) {
        if link.is_outbound() {
            self.splice(addr);
        }
        // Inbound clients were registered when drained off the exchange.
    }

    async fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        self.teardown(addr, reason).await;
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    async fn timer_expired(&mut self) {
        self.drain_incoming().await;

        // Retry clients whose previous outbound attempt failed.
        let waiting = self
            .clients
            .iter()
            .filter_map(|(addr, state)| match state {
                ClientState::Pairing { outbound: None, .. } => Some(*addr),
                _ => None,
            })
            .collect::<Vec<_>>();
        for client in waiting {
            if !self.closed {
                self.request_outbound(client).await;
            }
        }

        // Time out outbound dials that never completed.
        let local_time = self.clock.local_time();
        let timed_out = self
            .outbounds
            .iter()
            .filter_map(|(addr, outbound)| match outbound.dialing {
                Some(since) if local_time - since >= self.config.connect_timeout => Some(*addr),
                _ => None,
            })
            .collect::<Vec<_>>();
        for addr in timed_out {
            self.push(Io::Disconnect(addr, DisconnectReason::ConnectionTimeout));
        }

        self.push(Io::SetTimer(INCOMING_POLL_INTERVAL));
    }
}
