use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;

use async_trait::async_trait;
use bitcoin::consensus::Encodable;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::{
    client,
    common::exchange::Exchange,
    common::time::SettableClock,
    fsm,
    fsm::event::Event,
    net::LocalTime,
    net::StateMachine,
    net::{Disconnect, Io, Link},
};

/// Client service. Wraps the group state machine, decodes and encodes
/// network messages, and publishes events to subscribers.
pub struct Service<E, C> {
    inboxes: HashMap<net::SocketAddr, client::stream::Decoder>,
    machine: fsm::handler::StateMachine<E, C>,
    events: broadcast::Sender<Event>,
}

impl<E: Exchange, C: SettableClock + Sync + Send> Service<E, C> {
    /// Create a new client service.
    pub fn new(
        machine: fsm::handler::StateMachine<E, C>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine,
            events,
        }
    }
}

#[async_trait]
impl<E, C> crate::net::Service for Service<E, C>
where
    E: Exchange + Send + Sync,
    C: SettableClock + Sync + Send,
{
    type Command = fsm::handler::Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl<E, C> StateMachine for Service<E, C>
where
    E: Exchange + Send + Sync,
    C: SettableClock + Sync + Send,
{
    type Message = [u8];
    type Event = Event;
    type DisconnectReason = fsm::handler::DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time).await;
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!("Received message from unknown peer {}", addr);
            return;
        };

        inbox.input(bytes.borrow());

        loop {
            match inbox.decode_next() {
                Ok(Some(msg)) => self.machine.message_received(addr, Cow::Owned(msg)).await,
                Ok(None) => break,
                Err(err) => {
                    error!("Invalid message received from {}. Error: {}", addr, err);
                    self.machine
                        .disconnect(*addr, fsm::handler::DisconnectReason::DecodeError);
                    return;
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        self.inboxes
            .insert(addr, client::stream::Decoder::new(1024));
        self.machine.connected(addr, local_addr, link);
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason).await
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired().await;
    }
}

impl<E, C> Iterator for Service<E, C> {
    type Item = Io<Vec<u8>, Event, fsm::handler::DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.machine.next() {
                Some(Io::Write(addr, msg)) => {
                    let mut buf = Vec::new();

                    msg.consensus_encode(&mut buf)
                        .expect("writing to an in-memory buffer doesn't fail");
                    return Some(Io::Write(addr, buf));
                }
                // Events go to the subscribers, not to the reactor.
                Some(Io::Event(event)) => {
                    self.events.send(event).ok();
                }
                Some(Io::Connect(addr)) => return Some(Io::Connect(addr)),
                Some(Io::Adopt(addr, stream, link)) => return Some(Io::Adopt(addr, stream, link)),
                Some(Io::Disconnect(addr, reason)) => return Some(Io::Disconnect(addr, reason)),
                Some(Io::SetTimer(duration)) => return Some(Io::SetTimer(duration)),

                None => return None,
            }
        }
    }
}
