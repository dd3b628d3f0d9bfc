//! Group handles are created from clients by users of the library, to
//! communicate with the underlying protocol instance.
use async_trait::async_trait;
use flume as chan;
use thiserror::Error;
use tokio::sync::broadcast;

use bitcoin::block::Header;
use bitcoin::network::message::NetworkMessage;
use bitcoin::{BlockHash, Transaction, Txid};

use crate::common::exchange;
use crate::common::peer::Peer;
use crate::fsm::event::Event;
use crate::fsm::handler::{Command, CommandError, PeerId};
use crate::fsm::reqmgr::{BlockOpts, Blocks, HeaderOpts};

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The group rejected the operation.
    #[error(transparent)]
    Group(#[from] CommandError),
    /// The peer exchange failed.
    #[error(transparent)]
    Exchange(#[from] exchange::Error),
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a group process.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a command to the group.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Start maintaining the peer pool. Returns as soon as the work is
    /// scheduled; admissions surface as events.
    async fn connect(&self) -> Result<(), Error>;

    /// Shut the group down. Completes once every admitted peer has
    /// disconnected.
    async fn close(&self) -> Result<(), Error>;

    /// Start accepting inbound exchange peers.
    async fn accept(&self, port: Option<u16>) -> Result<(), Error>;

    /// Stop accepting inbound exchange peers.
    async fn unaccept(&self) -> Result<(), Error>;

    /// Send a message to every admitted peer. With `assert`, fails unless
    /// at least one peer is connected. Returns the recipients.
    async fn send(&self, msg: NetworkMessage, assert: bool) -> Result<Vec<PeerId>, Error>;

    /// The admitted peers.
    async fn get_peers(&self) -> Result<Vec<Peer>, Error>;

    /// A random admitted peer. Fails when the pool is empty.
    async fn random_peer(&self) -> Result<Peer, Error>;

    /// Request blocks by hash. Retries on a different peer for as long as
    /// peers keep timing out.
    async fn get_blocks(
        &self,
        hashes: Vec<BlockHash>,
        opts: BlockOpts,
    ) -> Result<(Blocks, PeerId), Error>;

    /// Request transactions by id.
    async fn get_transactions(
        &self,
        block_hash: Option<BlockHash>,
        txids: Vec<Txid>,
    ) -> Result<(Vec<Transaction>, PeerId), Error>;

    /// Request headers starting from a locator.
    async fn get_headers(
        &self,
        locator: Vec<BlockHash>,
        opts: HeaderOpts,
    ) -> Result<(Vec<Header>, PeerId), Error>;

    /// Subscribe to the group event feed.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn connect(&self) -> Result<(), Error>;
        async fn close(&self) -> Result<(), Error>;
        async fn accept(&self, port: Option<u16>) -> Result<(), Error>;
        async fn unaccept(&self) -> Result<(), Error>;
        async fn send(&self, msg: NetworkMessage, assert: bool) -> Result<Vec<PeerId>, Error>;
        async fn get_peers(&self) -> Result<Vec<Peer>, Error>;
        async fn random_peer(&self) -> Result<Peer, Error>;
        async fn get_blocks(
            &self,
            hashes: Vec<BlockHash>,
            opts: BlockOpts,
        ) -> Result<(Blocks, PeerId), Error>;
        async fn get_transactions(
            &self,
            block_hash: Option<BlockHash>,
            txids: Vec<Txid>,
        ) -> Result<(Vec<Transaction>, PeerId), Error>;
        async fn get_headers(
            &self,
            locator: Vec<BlockHash>,
            opts: HeaderOpts,
        ) -> Result<(Vec<Header>, PeerId), Error>;
        fn subscribe(&self) -> broadcast::Receiver<Event>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockHandle::new();
    }
}
