//! The peer-group client library.
#![allow(clippy::inconsistent_struct_constructor)]
#![allow(clippy::type_complexity)]
mod controller;
pub use controller::*;
mod bridge;
pub use bridge::*;
mod error;

pub mod handle;
mod service;
pub(crate) mod stream;

pub use error::Error as ClientError;
pub use stream::{BlockStream, HeaderStream, TxStream};
