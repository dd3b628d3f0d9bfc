//! State machine events.
use std::sync::Arc;

use bitcoin::network::message::NetworkMessage;
use bitcoin::{Block, MerkleBlock, Transaction};

use crate::fsm::{
    bridge::Event as BridgeEvent, handler::PeerId, peermgr::Event as PeerEvent,
    reqmgr::Event as RequestEvent,
};
use crate::net::LocalTime;

/// An event emitted by the peer group.
///
/// Every message received from an admitted peer surfaces both as the generic
/// [`Event::Message`] and, for blocks, merkle blocks and transactions, as a
/// variant carrying the decoded payload. Consumers waiting for one specific
/// object filter on its hash (see `client::stream`).
#[derive(Debug, Clone)]
pub enum Event {
    /// The group is initializing its state machine and about to start network activity.
    Initializing,
    /// The group is initialized and ready to receive commands.
    Ready {
        /// Local time.
        time: LocalTime,
    },
    /// A peer manager event: admissions, connection failures, disconnects.
    Peer(PeerEvent),
    /// Received a message from an admitted peer.
    Message {
        /// The sending peer.
        addr: PeerId,
        /// The message payload.
        msg: NetworkMessage,
    },
    /// Received a block.
    Block {
        /// The sending peer.
        addr: PeerId,
        /// The block.
        block: Block,
    },
    /// Received a merkle block.
    MerkleBlock {
        /// The sending peer.
        addr: PeerId,
        /// The merkle block.
        merkle_block: MerkleBlock,
    },
    /// A transaction was observed for the first time.
    Tx {
        /// The peer that first relayed it.
        addr: PeerId,
        /// The transaction.
        tx: Transaction,
    },
    /// A request dispatcher event.
    Request(RequestEvent),
    /// An admitted peer failed; it is being disconnected.
    PeerError {
        /// The failing peer.
        addr: PeerId,
        /// What went wrong.
        error: Arc<std::io::Error>,
    },
    /// A bridge controller event.
    Bridge(BridgeEvent),
    /// An unrecoverable error.
    Error(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<RequestEvent> for Event {
    fn from(e: RequestEvent) -> Self {
        Self::Request(e)
    }
}

impl From<BridgeEvent> for Event {
    fn from(e: BridgeEvent) -> Self {
        Self::Bridge(e)
    }
}
