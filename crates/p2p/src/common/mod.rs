//! Types shared between the state machines and the client layer.
pub mod exchange;
pub mod peer;
pub mod time;
