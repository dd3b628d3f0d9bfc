//! A peer-group coordinator for Bitcoin-style peer-to-peer networks.
//!
//! The group maintains a pool of outbound peers found through several
//! discovery methods, multiplexes requests across the pool with retry on
//! timeout, and aggregates per-peer messages into a single event feed. A
//! bridge variant pairs every inbound peer-exchange client with a freshly
//! dialed outbound peer and splices the two byte streams.
#![allow(clippy::type_complexity)]
pub mod client;
pub mod common;
pub mod fsm;
pub mod net;
