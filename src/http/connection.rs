use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::parser::{parse_body, parse_request_head, ParseError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::dispatcher::{Dispatcher, Verdict};
use crate::proxy::rejection::Rejection;
use crate::proxy::upstream::UpstreamResponse;

pub struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    state: ConnectionState,
    dispatcher: Arc<Dispatcher>,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(Reply, bool), // bool = keep_alive?
    Closed,
}

/// What goes back to the client for one request.
pub enum Reply {
    Fixed(Response),
    Relayed(UpstreamResponse),
}

enum Inbound {
    Request(Request),
    /// Rejected on its head alone while the body was still pending.
    Refused(Rejection),
    Malformed(ParseError),
    Eof,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            dispatcher,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let state = std::mem::replace(&mut self.state, ConnectionState::Closed);

            self.state = match state {
                ConnectionState::Reading => match self.read_request().await? {
                    Inbound::Request(req) => ConnectionState::Processing(req),
                    Inbound::Malformed(e) => {
                        tracing::debug!(error = %e, "Malformed request");
                        let response = Rejection::BadRequest.to_response().closing();
                        ConnectionState::Writing(Reply::Fixed(response), false)
                    }
                    Inbound::Refused(rejection) => {
                        // The unread body makes the connection unusable.
                        let response = rejection.to_response().closing();
                        ConnectionState::Writing(Reply::Fixed(response), false)
                    }
                    Inbound::Eof => ConnectionState::Closed,
                },

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let reply = match self.dispatcher.dispatch(&req).await {
                        Verdict::Relayed(upstream) => Reply::Relayed(upstream),
                        Verdict::Rejected(rejection) if keep_alive => {
                            Reply::Fixed(rejection.to_response())
                        }
                        Verdict::Rejected(rejection) => {
                            Reply::Fixed(rejection.to_response().closing())
                        }
                    };
                    ConnectionState::Writing(reply, keep_alive)
                }

                ConnectionState::Writing(reply, keep_alive) => {
                    let reusable = match reply {
                        Reply::Fixed(response) => {
                            ResponseWriter::new(&response)
                                .write_to_stream(&mut self.stream)
                                .await?;
                            true
                        }
                        Reply::Relayed(upstream) => {
                            match upstream.relay_to(&mut self.stream).await {
                                Ok(reusable) => reusable,
                                Err(e) => {
                                    // Part of the response may already be out; close.
                                    tracing::warn!(error = %e, "Relay aborted mid-response");
                                    false
                                }
                            }
                        }
                    };

                    if keep_alive && reusable {
                        ConnectionState::Reading // go back for next request
                    } else {
                        ConnectionState::Closed
                    }
                }

                ConnectionState::Closed => {
                    let _ = self.stream.shutdown().await;
                    break;
                }
            };
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<Inbound> {
        let head = loop {
            // Try parsing whatever we already have
            match parse_request_head(&self.buffer) {
                Ok(head) => break head,
                Err(ParseError::Incomplete) => {}
                Err(e) => return Ok(Inbound::Malformed(e)),
            }

            if !self.fill_buffer().await? {
                return Ok(Inbound::Eof);
            }
        };

        let mut screened = false;
        loop {
            match parse_body(head.framing, &self.buffer[head.len..]) {
                Ok((body, consumed)) => {
                    self.buffer.drain(..head.len + consumed);
                    return Ok(Inbound::Request(head.into_request(body)));
                }
                Err(ParseError::Incomplete) => {}
                Err(e) => return Ok(Inbound::Malformed(e)),
            }

            // Body still pending: refuse before buffering any more of it.
            if !screened {
                if let Err(rejection) = self.dispatcher.screen(&head.request) {
                    return Ok(Inbound::Refused(rejection));
                }
                screened = true;
            }

            if !self.fill_buffer().await? {
                return Ok(Inbound::Eof);
            }
        }
    }

    /// Reads more bytes into the buffer; `false` once the client has closed.
    async fn fill_buffer(&mut self) -> anyhow::Result<bool> {
        let mut temp = [0u8; 4096];
        let n = self.stream.read(&mut temp).await?;
        self.buffer.extend_from_slice(&temp[..n]);
        Ok(n > 0)
    }
}
