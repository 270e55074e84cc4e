//! Authorization and relay
//!
//! This module decides what happens to each parsed request and, for allowed
//! ones, forwards it to the target socket.

pub mod dispatcher;
pub mod rejection;
pub mod upstream;

pub use dispatcher::{Dispatcher, Verdict};
pub use rejection::Rejection;
pub use upstream::{RelayClient, RelayError, UpstreamResponse, RELAY_TIMEOUT};
