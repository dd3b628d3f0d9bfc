use std::time;

use async_trait::async_trait;
use flume as chan;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use bitcoin::block::Header;
use bitcoin::network::message::NetworkMessage;
use bitcoin::{Block, BlockHash, Transaction, Txid};

use crate::{
    client::error::Error,
    client::handle,
    client::service::Service,
    common::exchange::Exchange,
    common::peer::Peer,
    common::time::RefClock,
    fsm::discovery::Producer,
    fsm::event::Event,
    fsm::handler::{Command, PeerId, StateMachine},
    fsm::reqmgr::{BlockOpts, Blocks, HeaderOpts},
    net::{LocalTime, NetReactor, NetWaker},
};

/// Group client configuration.
pub use crate::fsm::handler::Config as GroupConfig;

/// Capacity of the group event feed. Slow subscribers that fall further
/// behind than this skip events.
pub const EVENT_CHANNEL_SIZE: usize = 1024;

/// Runs a pre-loaded peer group.
pub struct GroupClient<R: NetReactor, E: Exchange> {
    handle: Handle<R::Waker>,
    service: Service<E, RefClock>,
    commands: chan::Receiver<Command>,
    reactor: R,
}

impl<R: NetReactor, E: Exchange + Send + Sync> GroupClient<R, E> {
    /// Create a new client.
    ///
    /// The exchange is the group's gateway to web transports; deployments
    /// without one use `NullExchange`. An optional custom producer becomes
    /// one of the discovery methods.
    pub fn new(
        config: GroupConfig,
        exchange: E,
        producer: Option<Box<dyn Producer>>,
    ) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let reactor = <R as NetReactor>::new()?;
        let clock = RefClock::from(LocalTime::now());
        let rng = fastrand::Rng::new();

        let machine = StateMachine::new(config, exchange, producer, rng, clock);
        let service = Service::new(machine, events.clone());

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            events,
        };

        Ok(GroupClient {
            handle,
            service,
            commands: commands_rx,
            reactor,
        })
    }

    /// Run a pre-loaded group client.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(self.service, self.commands, cancellation)
            .await;

        if let Err(e) = result {
            tracing::error!("Peer group is down. Client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }
}

/// Handle to a running group.
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub(crate) commands: chan::Sender<Command>,
    pub(crate) waker: W,
    /// Time to wait on a command reply before giving up.
    pub timeout: time::Duration,
    pub(crate) events: broadcast::Sender<Event>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }

    /// Wake the subscriber when one specific block arrives, by hash.
    pub async fn wait_for_block(&self, hash: BlockHash) -> Result<Block, handle::Error> {
        let mut events = self.events.subscribe();

        loop {
            match events.recv().await {
                Ok(Event::Block { block, .. }) if block.block_hash() == hash => {
                    return Ok(block);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(handle::Error::Disconnected)
                }
            }
        }
    }

    /// Wake the subscriber when one specific transaction arrives, by id.
    pub async fn wait_for_tx(&self, txid: Txid) -> Result<Transaction, handle::Error> {
        let mut events = self.events.subscribe();

        loop {
            match events.recv().await {
                Ok(Event::Tx { tx, .. }) if tx.txid() == txid => return Ok(tx),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(handle::Error::Disconnected)
                }
            }
        }
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn connect(&self) -> Result<(), handle::Error> {
        self.command(Command::Connect).await
    }

    async fn close(&self) -> Result<(), handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Close(transmit)).await?;

        receive.recv_async().await?;
        Ok(())
    }

    async fn accept(&self, port: Option<u16>) -> Result<(), handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Accept(port, transmit)).await?;

        receive.recv_async().await??;
        Ok(())
    }

    async fn unaccept(&self) -> Result<(), handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Unaccept(transmit)).await?;

        receive.recv_async().await??;
        Ok(())
    }

    async fn send(&self, msg: NetworkMessage, assert: bool) -> Result<Vec<PeerId>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Broadcast(msg, assert, transmit)).await?;

        Ok(receive.recv_async().await??)
    }

    async fn get_peers(&self) -> Result<Vec<Peer>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetPeers(transmit)).await?;

        Ok(receive.recv_async().await?)
    }

    async fn random_peer(&self) -> Result<Peer, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::RandomPeer(transmit)).await?;

        Ok(receive.recv_async().await??)
    }

    async fn get_blocks(
        &self,
        hashes: Vec<BlockHash>,
        opts: BlockOpts,
    ) -> Result<(Blocks, PeerId), handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetBlocks(hashes, opts, transmit)).await?;

        Ok(receive.recv_async().await??)
    }

    async fn get_transactions(
        &self,
        block_hash: Option<BlockHash>,
        txids: Vec<Txid>,
    ) -> Result<(Vec<Transaction>, PeerId), handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetTransactions(block_hash, txids, transmit))
            .await?;

        Ok(receive.recv_async().await??)
    }

    async fn get_headers(
        &self,
        locator: Vec<BlockHash>,
        opts: HeaderOpts,
    ) -> Result<(Vec<Header>, PeerId), handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetHeaders(locator, opts, transmit)).await?;

        Ok(receive.recv_async().await??)
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::handle::Handle as _;
    use crate::common::exchange::NullExchange;
    use crate::net::reactor::ReactorTcp;

    #[test]
    fn test_client_construction() {
        let client: GroupClient<ReactorTcp, NullExchange> =
            GroupClient::new(GroupConfig::default(), NullExchange, None).unwrap();

        // Handles are cheap to clone and hand out.
        let handle = client.handle();
        let _subscription = handle.subscribe();
        let _another = handle.clone();
    }
}
