//! Message stream utilities.
use std::io;

use bitcoin::consensus::{deserialize_partial, encode::Error};
use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::{block, Block, Transaction};
use tokio::sync::broadcast;

use crate::fsm::event::Event;
use crate::fsm::handler::PeerId;

/// Message stream decoder.
///
/// Used to turn a byte stream into network messages.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns [`None`] if nothing was decoded.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, Error> {
        match deserialize_partial(self.unparsed.as_slice()) {
            Ok((msg, index)) => {
                self.unparsed.drain(..index);
                Ok(Some(msg))
            }

            Err(Error::Io(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Blocks received by the group, as a stream.
pub struct BlockStream {
    events: broadcast::Receiver<Event>,
}

impl BlockStream {
    /// Create a block stream over a group event feed.
    pub fn new(events: broadcast::Receiver<Event>) -> Self {
        Self { events }
    }

    /// The next block, or [`None`] once the group is gone. A slow consumer
    /// may skip blocks it lagged behind on.
    pub async fn recv(&mut self) -> Option<(PeerId, Block)> {
        loop {
            match self.events.recv().await {
                Ok(Event::Block { addr, block }) => return Some((addr, block)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Header announcements received by the group, as a stream.
pub struct HeaderStream {
    events: broadcast::Receiver<Event>,
}

impl HeaderStream {
    /// Create a header stream over a group event feed.
    pub fn new(events: broadcast::Receiver<Event>) -> Self {
        Self { events }
    }

    /// The next batch of headers, or [`None`] once the group is gone.
    pub async fn recv(&mut self) -> Option<(PeerId, Vec<block::Header>)> {
        loop {
            match self.events.recv().await {
                Ok(Event::Message {
                    addr,
                    msg: NetworkMessage::Headers(headers),
                }) => return Some((addr, headers)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// First observations of transactions, as a stream. Duplicate observations
/// across peers are already filtered by the group's inventory pool.
pub struct TxStream {
    events: broadcast::Receiver<Event>,
}

impl TxStream {
    /// Create a transaction stream over a group event feed.
    pub fn new(events: broadcast::Receiver<Event>) -> Self {
        Self { events }
    }

    /// The next fresh transaction, or [`None`] once the group is gone.
    pub async fn recv(&mut self) -> Option<(PeerId, Transaction)> {
        loop {
            match self.events.recv().await {
                Ok(Event::Tx { addr, tx }) => return Some((addr, tx)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::consensus::Encodable;

    use flock_types::Network;

    #[test]
    fn test_decoder_handles_partial_input() {
        let msg = RawNetworkMessage {
            magic: Network::Regtest.magic(),
            payload: NetworkMessage::Ping(7),
        };
        let mut bytes = Vec::new();
        msg.consensus_encode(&mut bytes).unwrap();

        let mut decoder = Decoder::new(1024);

        let (head, tail) = bytes.split_at(bytes.len() / 2);
        decoder.input(head);
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.input(tail);
        let decoded = decoder.decode_next().unwrap().expect("a whole message");
        assert_eq!(decoded, msg);
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_decoder_yields_back_to_back_messages() {
        let mut bytes = Vec::new();
        for nonce in 0..3u64 {
            RawNetworkMessage {
                magic: Network::Regtest.magic(),
                payload: NetworkMessage::Ping(nonce),
            }
            .consensus_encode(&mut bytes)
            .unwrap();
        }

        let mut decoder = Decoder::new(1024);
        decoder.input(&bytes);

        for nonce in 0..3u64 {
            let decoded = decoder.decode_next().unwrap().expect("a whole message");
            assert_eq!(decoded.payload, NetworkMessage::Ping(nonce));
        }
        assert!(decoder.decode_next().unwrap().is_none());
    }
}
