use std::borrow::Cow;
use std::net;
use std::time;

use async_trait::async_trait;
use flume as chan;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    client::controller::{Handle, EVENT_CHANNEL_SIZE},
    client::error::Error,
    client::handle,
    common::exchange::Exchange,
    common::time::{RefClock, SettableClock},
    fsm::bridge::BridgeMachine,
    fsm::event::Event,
    fsm::handler::{Command, CommandError, Config, DisconnectReason},
    net::{Disconnect, Io, Link, LocalTime, NetReactor, NetWaker, StateMachine},
};

/// Bridge service: drives the bridge state machine and publishes its
/// events. Bytes pass through untouched, there is no message framing.
pub struct BridgeService<E, C> {
    machine: BridgeMachine<E, C>,
    events: broadcast::Sender<Event>,
}

impl<E: Exchange, C: SettableClock + Sync + Send> BridgeService<E, C> {
    /// Create a new bridge service.
    pub fn new(machine: BridgeMachine<E, C>, events: broadcast::Sender<Event>) -> Self {
        Self { machine, events }
    }
}

#[async_trait]
impl<E, C> crate::net::Service for BridgeService<E, C>
where
    E: Exchange + Send + Sync,
    C: SettableClock + Sync + Send,
{
    type Command = Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl<E, C> StateMachine for BridgeService<E, C>
where
    E: Exchange + Send + Sync,
    C: SettableClock + Sync + Send,
{
    type Message = [u8];
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time).await;
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        self.machine.message_received(addr, bytes).await;
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        self.machine.connected(addr, local_addr, link);
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.machine.disconnected(addr, reason).await
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired().await;
    }
}

impl<E, C> Iterator for BridgeService<E, C> {
    type Item = Io<Vec<u8>, Event, DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.machine.next() {
                // Events go to the subscribers, not to the reactor.
                Some(Io::Event(event)) => {
                    self.events.send(event).ok();
                }
                Some(io) => return Some(io),
                None => return None,
            }
        }
    }
}

/// Runs a pre-loaded bridge.
pub struct BridgeClient<R: NetReactor, E: Exchange> {
    handle: BridgeHandle<R::Waker>,
    service: BridgeService<E, RefClock>,
    commands: chan::Receiver<Command>,
    reactor: R,
}

impl<R: NetReactor, E: Exchange + Send + Sync> BridgeClient<R, E> {
    /// Create a new bridge client.
    pub fn new(config: Config, exchange: E) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let reactor = <R as NetReactor>::new()?;
        let clock = RefClock::from(LocalTime::now());
        let rng = fastrand::Rng::new();

        let machine = BridgeMachine::new(config, exchange, rng, clock);
        let service = BridgeService::new(machine, events.clone());

        let handle = BridgeHandle {
            inner: Handle {
                commands: commands_tx,
                waker: reactor.waker(),
                timeout: time::Duration::from_secs(60),
                events,
            },
        };

        Ok(BridgeClient {
            handle,
            service,
            commands: commands_rx,
            reactor,
        })
    }

    /// Run a pre-loaded bridge client.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(self.service, self.commands, cancellation)
            .await;

        if let Err(e) = result {
            tracing::error!("Bridge is down. Client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> BridgeHandle<R::Waker> {
        self.handle.clone()
    }
}

/// Handle to a running bridge. Exposes only the inbound side of the group
/// API: outbound connections happen as pairing counterparts and can't be
/// requested directly.
#[derive(Clone)]
pub struct BridgeHandle<W: NetWaker> {
    inner: Handle<W>,
}

impl<W: NetWaker> BridgeHandle<W> {
    /// Bridges relay inbound clients only; asking for outbound connections
    /// fails without touching the machine.
    pub fn connect(&self) -> Result<(), handle::Error> {
        Err(CommandError::BridgeOutbound.into())
    }

    /// Shut the bridge down. Completes once every pair is torn down.
    pub async fn close(&self) -> Result<(), handle::Error> {
        use handle::Handle as _;

        self.inner.close().await
    }

    /// Start accepting inbound exchange clients.
    pub async fn accept(&self, port: Option<u16>) -> Result<(), handle::Error> {
        use handle::Handle as _;

        self.inner.accept(port).await
    }

    /// Stop accepting inbound exchange clients.
    pub async fn unaccept(&self) -> Result<(), handle::Error> {
        use handle::Handle as _;

        self.inner.unaccept().await
    }

    /// Subscribe to the bridge event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::net::reactor::ReactorTcp;
    use crate::{common::exchange::NullExchange, net::Waker};

    #[test]
    fn test_bridge_connect_fails_synchronously() {
        let client: BridgeClient<ReactorTcp, NullExchange> =
            BridgeClient::new(Config::default(), NullExchange).unwrap();
        let handle: BridgeHandle<Waker> = client.handle();

        let err = handle.connect().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Do not use connect() with Bridge, only incoming connections are allowed"
        );
    }
}
