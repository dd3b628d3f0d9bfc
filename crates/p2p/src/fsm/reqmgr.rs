//! Request dispatching.
//!
//! Every request is assigned to a random admitted peer. If the peer doesn't
//! answer within the request timeout it is disconnected and the request is
//! re-dispatched to a different peer, with no upper bound on the number of
//! attempts: bounding retries is the caller's policy.
use std::collections::{HashMap, HashSet};

use bitcoin::block::Header;
use bitcoin::network::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::{Block, BlockHash, MerkleBlock, Transaction, Txid};

use bitcoin::hashes::Hash;
use flume as chan;
use tracing::debug;

use crate::common::time::Clock;
use crate::fsm::handler::{CommandError, DisconnectReason, PeerId};
use crate::net::{LocalDuration, LocalTime};

use super::output::{Disconnect, SetTimer, Wire};

/// Time to wait for a peer to answer a request.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(8);

/// Inventory type of a filtered (merkle) block, per BIP-37.
const MSG_FILTERED_BLOCK: u32 = 3;

/// An event emitted by the request manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A request timed out on a peer. The peer is disconnected and the
    /// request moves to another one.
    TimedOut {
        /// The peer that failed to answer.
        addr: PeerId,
        /// The kind of request that timed out.
        request: &'static str,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::TimedOut { addr, request } => {
                write!(fmt, "{}: `{}` request timed out", addr, request)
            }
        }
    }
}

/// Options for block requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockOpts {
    /// Request filtered (merkle) blocks instead of full blocks.
    pub filtered: bool,
}

/// Options for header requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderOpts {
    /// Hash to stop at, if any.
    pub stop_hash: Option<BlockHash>,
}

/// Result of a block request.
#[derive(Debug, Clone)]
pub enum Blocks {
    /// Full blocks, in order of arrival.
    Full(Vec<Block>),
    /// Merkle blocks, in order of arrival.
    Filtered(Vec<MerkleBlock>),
}

/// A pending request.
#[derive(Debug)]
enum InFlight {
    Blocks {
        remaining: HashSet<BlockHash>,
        filtered: bool,
        blocks: Vec<Block>,
        merkle_blocks: Vec<MerkleBlock>,
        reply: chan::Sender<Result<(Blocks, PeerId), CommandError>>,
    },
    Transactions {
        remaining: HashSet<Txid>,
        txs: Vec<Transaction>,
        reply: chan::Sender<Result<(Vec<Transaction>, PeerId), CommandError>>,
    },
    Headers {
        locator: Vec<BlockHash>,
        stop_hash: Option<BlockHash>,
        reply: chan::Sender<Result<(Vec<Header>, PeerId), CommandError>>,
    },
}

impl InFlight {
    fn name(&self) -> &'static str {
        match self {
            Self::Blocks { .. } => "getblocks",
            Self::Transactions { .. } => "gettransactions",
            Self::Headers { .. } => "getheaders",
        }
    }
}

#[derive(Debug)]
struct Request {
    peer: PeerId,
    since: LocalTime,
    req: InFlight,
}

/// Tracks in-flight requests and their timeouts.
#[derive(Debug)]
pub struct RequestManager<U, C> {
    pending: HashMap<u64, Request>,
    next_id: u64,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U, C> RequestManager<U, C>
where
    U: Wire<Event> + SetTimer + Disconnect,
    C: Clock,
{
    /// Create a new request manager.
    pub fn new(rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 0,
            upstream,
            rng,
            clock,
        }
    }

    /// Number of requests awaiting an answer.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether there are no requests awaiting an answer.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Request blocks by hash from a random peer.
    pub fn get_blocks(
        &mut self,
        hashes: Vec<BlockHash>,
        opts: BlockOpts,
        peers: &[PeerId],
        reply: chan::Sender<Result<(Blocks, PeerId), CommandError>>,
    ) {
        let remaining = hashes.into_iter().collect();
        self.dispatch(
            InFlight::Blocks {
                remaining,
                filtered: opts.filtered,
                blocks: Vec::new(),
                merkle_blocks: Vec::new(),
                reply,
            },
            peers,
        );
    }

    /// Request transactions by id from a random peer.
    pub fn get_transactions(
        &mut self,
        txids: Vec<Txid>,
        peers: &[PeerId],
        reply: chan::Sender<Result<(Vec<Transaction>, PeerId), CommandError>>,
    ) {
        let remaining = txids.iter().copied().collect();
        self.dispatch(
            InFlight::Transactions {
                remaining,
                txs: Vec::new(),
                reply,
            },
            peers,
        );
    }

    /// Request headers from a random peer.
    pub fn get_headers(
        &mut self,
        locator: Vec<BlockHash>,
        opts: HeaderOpts,
        peers: &[PeerId],
        reply: chan::Sender<Result<(Vec<Header>, PeerId), CommandError>>,
    ) {
        self.dispatch(
            InFlight::Headers {
                locator,
                stop_hash: opts.stop_hash,
                reply,
            },
            peers,
        );
    }

    /// Assign a request to a random peer and send it.
    fn dispatch(&mut self, req: InFlight, peers: &[PeerId]) {
        if peers.is_empty() {
            req.fail(CommandError::NotConnected);
            return;
        }
        let peer = peers[self.rng.usize(..peers.len())];
        let id = self.next_id;
        self.next_id += 1;

        self.send(peer, &req);
        self.pending.insert(
            id,
            Request {
                peer,
                since: self.clock.local_time(),
                req,
            },
        );
        self.upstream.set_timer(REQUEST_TIMEOUT);
    }

    /// Send the wire message of a request to its assigned peer.
    fn send(&mut self, peer: PeerId, req: &InFlight) {
        match req {
            InFlight::Blocks {
                remaining,
                filtered,
                ..
            } => {
                let inventory = remaining
                    .iter()
                    .map(|hash| {
                        if *filtered {
                            Inventory::Unknown {
                                inv_type: MSG_FILTERED_BLOCK,
                                hash: hash.to_byte_array(),
                            }
                        } else {
                            Inventory::Block(*hash)
                        }
                    })
                    .collect();
                self.upstream.get_data(peer, inventory);
            }
            InFlight::Transactions { remaining, .. } => {
                let inventory = remaining.iter().map(|txid| Inventory::Transaction(*txid)).collect();
                self.upstream.get_data(peer, inventory);
            }
            InFlight::Headers {
                locator, stop_hash, ..
            } => {
                let msg = GetHeadersMessage::new(
                    locator.clone(),
                    stop_hash.unwrap_or_else(BlockHash::all_zeros),
                );
                self.upstream.get_headers(peer, msg);
            }
        }
    }

    /// Called when a block was received.
    pub fn received_block(&mut self, addr: &PeerId, block: &Block) {
        let hash = block.block_hash();

        let Some(id) = self.pending.iter().find_map(|(id, r)| match &r.req {
            InFlight::Blocks {
                remaining,
                filtered: false,
                ..
            } if r.peer == *addr && remaining.contains(&hash) => Some(*id),
            _ => None,
        }) else {
            return;
        };

        let mut done = false;
        if let Some(request) = self.pending.get_mut(&id) {
            if let InFlight::Blocks {
                remaining, blocks, ..
            } = &mut request.req
            {
                remaining.remove(&hash);
                blocks.push(block.clone());
                done = remaining.is_empty();
            }
        }
        if done {
            if let Some(Request {
                peer,
                req: InFlight::Blocks { blocks, reply, .. },
                ..
            }) = self.pending.remove(&id)
            {
                reply.send(Ok((Blocks::Full(blocks), peer))).ok();
            }
        }
    }

    /// Called when a merkle block was received.
    pub fn received_merkle_block(&mut self, addr: &PeerId, merkle_block: &MerkleBlock) {
        let hash = merkle_block.header.block_hash();

        let Some(id) = self.pending.iter().find_map(|(id, r)| match &r.req {
            InFlight::Blocks {
                remaining,
                filtered: true,
                ..
            } if r.peer == *addr && remaining.contains(&hash) => Some(*id),
            _ => None,
        }) else {
            return;
        };

        let mut done = false;
        if let Some(request) = self.pending.get_mut(&id) {
            if let InFlight::Blocks {
                remaining,
                merkle_blocks,
                ..
            } = &mut request.req
            {
                remaining.remove(&hash);
                merkle_blocks.push(merkle_block.clone());
                done = remaining.is_empty();
            }
        }
        if done {
            if let Some(Request {
                peer,
                req:
                    InFlight::Blocks {
                        merkle_blocks,
                        reply,
                        ..
                    },
                ..
            }) = self.pending.remove(&id)
            {
                reply.send(Ok((Blocks::Filtered(merkle_blocks), peer))).ok();
            }
        }
    }

    /// Called when a transaction was received.
    pub fn received_tx(&mut self, addr: &PeerId, tx: &Transaction) {
        let txid = tx.txid();

        let Some(id) = self.pending.iter().find_map(|(id, r)| match &r.req {
            InFlight::Transactions { remaining, .. }
                if r.peer == *addr && remaining.contains(&txid) =>
            {
                Some(*id)
            }
            _ => None,
        }) else {
            return;
        };

        let mut done = false;
        if let Some(request) = self.pending.get_mut(&id) {
            if let InFlight::Transactions { remaining, txs, .. } = &mut request.req {
                remaining.remove(&txid);
                txs.push(tx.clone());
                done = remaining.is_empty();
            }
        }
        if done {
            if let Some(Request {
                peer,
                req: InFlight::Transactions { txs, reply, .. },
                ..
            }) = self.pending.remove(&id)
            {
                reply.send(Ok((txs, peer))).ok();
            }
        }
    }

    /// Called when headers were received. The first headers message from the
    /// assigned peer answers the request.
    pub fn received_headers(&mut self, addr: &PeerId, headers: &[Header]) {
        let Some(id) = self.pending.iter().find_map(|(id, r)| match &r.req {
            InFlight::Headers { .. } if r.peer == *addr => Some(*id),
            _ => None,
        }) else {
            return;
        };

        if let Some(Request {
            peer,
            req: InFlight::Headers { reply, .. },
            ..
        }) = self.pending.remove(&id)
        {
            reply.send(Ok((headers.to_vec(), peer))).ok();
        }
    }

    /// Called when a timer expires: requests that outlived the timeout are
    /// moved to a different peer, and the unresponsive peer is disconnected.
    pub fn received_wake(&mut self, peers: &[PeerId]) {
        let local_time = self.clock.local_time();

        let timed_out = self
            .pending
            .iter()
            .filter(|(_, r)| local_time - r.since >= REQUEST_TIMEOUT)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in timed_out {
            let Some(request) = self.pending.remove(&id) else {
                continue;
            };
            debug!(
                target: "p2p",
                "{}: `{}` request timed out, retrying elsewhere",
                request.peer,
                request.req.name()
            );

            self.upstream.event(Event::TimedOut {
                addr: request.peer,
                request: request.req.name(),
            });
            self.upstream
                .disconnect(request.peer, DisconnectReason::RequestTimeout);

            let candidates = peers
                .iter()
                .copied()
                .filter(|p| *p != request.peer)
                .collect::<Vec<_>>();

            self.redispatch(request.req, &candidates);
        }

        if !self.pending.is_empty() {
            self.upstream.set_timer(REQUEST_TIMEOUT);
        }
    }

    /// Called when a peer disconnected: its in-flight requests move to other
    /// peers.
    pub fn peer_disconnected(&mut self, addr: &PeerId, peers: &[PeerId]) {
        let orphaned = self
            .pending
            .iter()
            .filter(|(_, r)| r.peer == *addr)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        let candidates = peers
            .iter()
            .copied()
            .filter(|p| p != addr)
            .collect::<Vec<_>>();

        for id in orphaned {
            if let Some(request) = self.pending.remove(&id) {
                self.redispatch(request.req, &candidates);
            }
        }
    }

    /// Re-dispatch a request, failing it when no peers remain.
    fn redispatch(&mut self, req: InFlight, peers: &[PeerId]) {
        if peers.is_empty() {
            req.fail(CommandError::NotConnected);
            return;
        }
        self.dispatch(req, peers);
    }

    /// Drop every pending request. Their reply channels close without an
    /// answer, which callers observe as the group having shut down.
    pub fn close(&mut self) {
        self.pending.clear();
    }
}

impl InFlight {
    fn fail(self, err: CommandError) {
        match self {
            Self::Blocks { reply, .. } => {
                reply.send(Err(err)).ok();
            }
            Self::Transactions { reply, .. } => {
                reply.send(Err(err)).ok();
            }
            Self::Headers { reply, .. } => {
                reply.send(Err(err)).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::block::Version;
    use bitcoin::hash_types::TxMerkleNode;
    use bitcoin::pow::CompactTarget;

    use flock_types::Network;

    use crate::common::time::{RefClock, SettableClock};
    use crate::fsm::event::Event as GroupEvent;
    use crate::fsm::output::{Io, Outbox};

    fn block(nonce: u32) -> Block {
        Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x1d00ffff),
                nonce,
            },
            txdata: vec![],
        }
    }

    struct Harness {
        mgr: RequestManager<Outbox, RefClock>,
        outbox: Outbox,
        clock: RefClock,
    }

    impl Harness {
        fn new() -> Self {
            let outbox = Outbox::new(Network::Regtest.magic());
            let clock = RefClock::from(LocalTime::from_secs(100_000));
            let mgr = RequestManager::new(
                fastrand::Rng::with_seed(21),
                outbox.clone(),
                clock.clone(),
            );

            Self { mgr, outbox, clock }
        }

        fn drain(&mut self) -> Vec<Io> {
            self.outbox.by_ref().collect()
        }

        /// The peer a `getdata` or `getheaders` was last sent to.
        fn sent_to(&mut self) -> Option<PeerId> {
            self.drain().into_iter().rev().find_map(|io| match io {
                Io::Write(addr, _) => Some(addr),
                _ => None,
            })
        }

        fn elapse(&mut self, duration: LocalDuration) {
            let now = self.clock.local_time();
            self.clock.set(now + duration);
        }
    }

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n)
            .map(|i| ([10, 0, 0, i as u8 + 1], 8333).into())
            .collect()
    }

    #[test]
    fn test_no_peers_fails_synchronously() {
        let mut h = Harness::new();
        let (reply, recv) = chan::bounded(1);

        h.mgr.get_blocks(vec![block(1).block_hash()], BlockOpts::default(), &[], reply);

        let err = recv.recv().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Not connected to any peers");
    }

    #[test]
    fn test_get_blocks_completes_when_all_blocks_arrived() {
        let mut h = Harness::new();
        let peers = peers(1);
        let (one, two) = (block(1), block(2));
        let (reply, recv) = chan::bounded(1);

        h.mgr.get_blocks(
            vec![one.block_hash(), two.block_hash()],
            BlockOpts::default(),
            &peers,
            reply,
        );
        let assigned = h.sent_to().expect("a getdata must have been sent");
        assert_eq!(assigned, peers[0]);

        // A block we never asked for is ignored.
        h.mgr.received_block(&assigned, &block(9));
        assert!(recv.try_recv().is_err());

        h.mgr.received_block(&assigned, &two);
        h.mgr.received_block(&assigned, &one);

        let (blocks, peer) = recv.recv().unwrap().unwrap();
        assert_eq!(peer, assigned);
        match blocks {
            Blocks::Full(blocks) => assert_eq!(blocks.len(), 2),
            Blocks::Filtered(_) => panic!("expected full blocks"),
        }
        assert!(h.mgr.is_empty());
    }

    #[test]
    fn test_timeout_disconnects_and_retries_on_another_peer() {
        let mut h = Harness::new();
        let peers = peers(2);
        let target = block(7);
        let (reply, recv) = chan::bounded(1);

        h.mgr
            .get_blocks(vec![target.block_hash()], BlockOpts::default(), &peers, reply);
        let first = h.sent_to().expect("a getdata must have been sent");

        h.elapse(REQUEST_TIMEOUT);
        h.mgr.received_wake(&peers);

        let ios = h.drain();
        let disconnected = ios.iter().any(|io| {
            matches!(io, Io::Disconnect(addr, DisconnectReason::RequestTimeout) if *addr == first)
        });
        assert!(disconnected, "the unresponsive peer must be disconnected");

        let timed_out = ios.iter().any(|io| {
            matches!(
                io,
                Io::Event(GroupEvent::Request(Event::TimedOut { addr, .. })) if *addr == first
            )
        });
        assert!(timed_out, "a request error must surface");

        // The retry goes to the other peer, whose answer completes the call.
        let second = ios
            .iter()
            .find_map(|io| match io {
                Io::Write(addr, _) => Some(*addr),
                _ => None,
            })
            .expect("the request must be re-sent");
        assert_ne!(second, first);

        h.mgr.received_block(&second, &target);

        let (_, peer) = recv.recv().unwrap().unwrap();
        assert_eq!(peer, second);
    }

    #[test]
    fn test_retry_with_no_other_peer_fails() {
        let mut h = Harness::new();
        let peers = peers(1);
        let (reply, recv) = chan::bounded(1);

        h.mgr
            .get_blocks(vec![block(1).block_hash()], BlockOpts::default(), &peers, reply);
        h.drain();

        h.elapse(REQUEST_TIMEOUT);
        h.mgr.received_wake(&peers);

        let err = recv.recv().unwrap().unwrap_err();
        assert!(matches!(err, CommandError::NotConnected));
    }

    #[test]
    fn test_get_headers_completes() {
        let mut h = Harness::new();
        let peers = peers(1);
        let (reply, recv) = chan::bounded(1);

        h.mgr.get_headers(
            vec![BlockHash::all_zeros()],
            HeaderOpts::default(),
            &peers,
            reply,
        );
        let assigned = h.sent_to().unwrap();

        let headers = vec![block(1).header, block(2).header];
        h.mgr.received_headers(&assigned, &headers);

        let (got, peer) = recv.recv().unwrap().unwrap();
        assert_eq!(peer, assigned);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_disconnect_moves_requests_elsewhere() {
        let mut h = Harness::new();
        let peers = peers(2);
        let tx_target = block(1); // unused blocks aside, build a tx request
        let _ = tx_target;

        let (reply, recv) = chan::bounded(1);
        h.mgr.get_headers(vec![BlockHash::all_zeros()], HeaderOpts::default(), &peers, reply);
        let first = h.sent_to().unwrap();

        h.mgr.peer_disconnected(&first, &peers);

        let second = h.sent_to().expect("the request must be re-sent");
        assert_ne!(second, first);

        h.mgr.received_headers(&second, &[block(1).header]);
        assert!(recv.recv().unwrap().is_ok());
    }
}
