//! Veilway protocol engine
//!
//! Client-side onion routing: circuits over a guard link, layered cell
//! crypto with running-digest authentication, flow control, and a v3
//! hidden-service client. The engine talks to the outside world only
//! through the capability traits in [`transport`].

pub mod cells;
pub mod circuit;
pub mod crypto;
pub mod hs;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use veilway_common::{EngineConfig, Error, Result};
