//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each manager, eg. the peer manager or the request dispatcher, is given a
//! copy of this outbox with specific capabilities, eg. peer disconnection,
//! message sending etc. to communicate with the network.
use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Mutex};

use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::network::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::network::message_network::VersionMessage;
use bitcoin::network::Magic;
use tracing::debug;

use crate::{
    fsm::event::Event,
    fsm::handler::{DisconnectReason, PeerId},
    net::{Link, LocalDuration},
};

/// Output of a state transition of the group state machine.
pub type Io = crate::net::Io<RawNetworkMessage, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to hand established streams to the reactor.
pub trait Adopt {
    /// Register a stream established outside the reactor.
    fn adopt(&self, addr: net::SocketAddr, stream: net::TcpStream, link: Link);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// Bitcoin wire protocol.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake messages //////////////////////////////////////////////////////

    /// Send a `version` message.
    fn version(&mut self, addr: PeerId, msg: VersionMessage);

    /// Send a `verack` message.
    fn verack(&mut self, addr: PeerId) -> &mut Self;

    // Ping/pong ///////////////////////////////////////////////////////////////

    /// Send a `pong` message.
    fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self;

    // Requests ////////////////////////////////////////////////////////////////

    /// Send a `getdata` message to a peer.
    fn get_data(&mut self, addr: PeerId, inventory: Vec<Inventory>);

    /// Send a `getheaders` message to a peer.
    fn get_headers(&mut self, addr: PeerId, msg: GetHeadersMessage);
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// Network magic, stamped on every outgoing message.
    magic: Magic,
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new(magic: Magic) -> Self {
        Self {
            magic,
            outbound: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a message to the channel.
    pub fn message(&mut self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "p2p", "Sending {:?} to {}", payload.cmd(), addr);

        self.push(Io::Write(
            addr,
            RawNetworkMessage {
                magic: self.magic,
                payload,
            },
        ));

        self
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "p2p", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl Adopt for Outbox {
    fn adopt(&self, addr: net::SocketAddr, stream: net::TcpStream, link: Link) {
        self.push(Io::Adopt(addr, stream, link));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "p2p", "{}", &event);
        self.event(event.into());
    }

    fn version(&mut self, addr: PeerId, msg: VersionMessage) {
        self.message(addr, NetworkMessage::Version(msg));
    }

    fn verack(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, NetworkMessage::Verack);
        self
    }

    fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Pong(nonce));
        self
    }

    fn get_data(&mut self, addr: PeerId, inventory: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(inventory));
    }

    fn get_headers(&mut self, addr: PeerId, msg: GetHeadersMessage) {
        self.message(addr, NetworkMessage::GetHeaders(msg));
    }
}
