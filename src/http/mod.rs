//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.1 server side of the proxy, with support
//! for keep-alive connections and pipelined requests.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The main connection handler implementing the request-response state machine
//! - **`parser`**: Parses incoming HTTP requests from byte buffers, including chunked bodies
//! - **`request`**: HTTP request representation and parsing utilities
//! - **`response`**: Locally generated responses (error bodies) with builder pattern
//! - **`writer`**: Serializes and writes HTTP responses to the client
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received (malformed → 400, then Closed)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Authorize, relay if allowed
//!        └──────┬───────────┘
//!               │ Reply ready (fixed body or upstream response)
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send reply to the client
//!        └──────┬───────────┘
//!               │ Reply sent
//!               ├─ Keep-Alive and self-delimited → Reading (same connection)
//!               └─ Otherwise → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use veil::http::connection::Connection;
//! use tokio::net::UnixListener;
//!
//! let listener = UnixListener::bind("/run/veil.sock")?;
//! loop {
//!     let (socket, _addr) = listener.accept().await?;
//!     let dispatcher = Arc::clone(&dispatcher);
//!     tokio::spawn(async move {
//!         let mut conn = Connection::new(socket, dispatcher);
//!         if let Err(e) = conn.run().await {
//!             eprintln!("Connection error: {}", e);
//!         }
//!     });
//! }
//! ```

pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
