//! Veil - allowlisting proxy for HTTP over UNIX domain sockets
//!
//! Core library: rule compilation, the HTTP/1.1 front end, and the relay to
//! the protected socket.

pub mod config;
pub mod http;
pub mod proxy;
pub mod rules;
pub mod server;
