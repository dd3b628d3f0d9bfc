//! Shared network parameters for the flock peer group.
mod network;

pub use crate::network::{
    Network, NetworkParseError, Params, WebSeed, WebSeedParseError, DEFAULT_WEB_PORT,
};
