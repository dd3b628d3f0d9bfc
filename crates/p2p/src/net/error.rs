//! Reactor errors.

use std::io;

use thiserror::Error;

/// A fatal error in the reactor event loop. Per-peer I/O failures are not
/// errors at this level; they surface as peer disconnects. What remains is
/// the event loop itself breaking.
#[derive(Error, Debug)]
pub enum Error {
    /// Polling for I/O readiness failed; the event loop can't continue.
    #[error("i/o readiness poll failed: {0}")]
    Poll(#[source] io::Error),
    /// A freshly established connection couldn't be inspected.
    #[error("connected socket is unusable: {0}")]
    Socket(#[from] io::Error),
}
