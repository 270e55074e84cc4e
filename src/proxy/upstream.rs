//! Relaying allowed requests to the target socket
//!
//! Every relayed request gets its own connection to the target UNIX socket
//! and is sent with `Connection: close`. A single deadline covers connecting,
//! sending, waiting for the response head, and streaming the response body
//! back. There are no retries.

use crate::http::request::{Method, Request};
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout_at, Instant};

/// Fixed bound on a relay attempt.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Host used for upstream requests; a UNIX socket has no host of its own.
pub const SYNTHETIC_HOST: &str = "unix";

/// Default buffer size for reading the upstream response
const BUFFER_SIZE: usize = 8192;

/// Upper bound on the upstream status line plus headers
const MAX_RESPONSE_HEAD_BYTES: usize = 64 * 1024;

/// Headers that describe the inbound hop and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "TE",
    "Trailer",
    "Expect",
];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot build upstream request: {0}")]
    Construction(String),

    #[error("cannot connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("relay I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed upstream response: {0}")]
    MalformedResponse(&'static str),

    #[error("upstream did not finish within {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    /// True when the failure is a defect on our side rather than the backend's.
    pub fn is_construction(&self) -> bool {
        matches!(self, RelayError::Construction(_))
    }
}

/// Client for the target socket. Cheap to clone, safe to share.
#[derive(Debug, Clone)]
pub struct RelayClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends `request` upstream and waits for the response head.
    ///
    /// The returned [`UpstreamResponse`] still owns the connection; its body
    /// is streamed by [`UpstreamResponse::relay_to`] under the same deadline.
    pub async fn send(&self, request: &Request) -> Result<UpstreamResponse, RelayError> {
        let deadline = Instant::now() + self.timeout;
        let payload = self.build_http_request(request)?;

        let (stream, head, buffered) = timeout_at(deadline, self.exchange(&payload))
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;

        tracing::trace!(
            socket = %self.socket_path.display(),
            status = head.status,
            "Upstream response head received"
        );

        Ok(UpstreamResponse {
            stream,
            raw_head: head.raw,
            status: head.status,
            framing: head.framing,
            buffered,
            deadline,
            timeout: self.timeout,
        })
    }

    /// Build HTTP request bytes to send upstream.
    ///
    /// Method, request target and body are passed through untouched. `Host`
    /// is replaced by the synthetic host and hop-by-hop headers are dropped.
    pub fn build_http_request(&self, request: &Request) -> Result<Vec<u8>, RelayError> {
        if !request.path.starts_with('/') {
            return Err(RelayError::Construction(format!(
                "request target {:?} is not origin-form",
                request.path
            )));
        }

        let url = url::Url::parse(&format!("http://{SYNTHETIC_HOST}{}", request.path))
            .map_err(|e| RelayError::Construction(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::Construction("upstream URL has no host".to_string()))?;

        let mut buffer = Vec::with_capacity(256 + request.body.len());

        // Request line
        buffer.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", request.method, request.path).as_bytes(),
        );

        // Headers named in `Connection` are hop-by-hop as well.
        let connection_listed = request.connection_options();

        for (key, value) in &request.headers {
            let dropped = HOP_BY_HOP_HEADERS
                .iter()
                .chain(connection_listed.iter())
                .chain(["Host", "Content-Length"].iter())
                .any(|h| h.eq_ignore_ascii_case(key));
            if !dropped {
                buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
            }
        }

        buffer.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
        buffer.extend_from_slice(b"Connection: close\r\n");

        let carries_body = matches!(request.method, Method::POST | Method::PUT | Method::PATCH);
        if carries_body || !request.body.is_empty() {
            buffer.extend_from_slice(
                format!("Content-Length: {}\r\n", request.body.len()).as_bytes(),
            );
        }

        // End of headers
        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(&request.body);

        Ok(buffer)
    }

    async fn exchange(
        &self,
        payload: &[u8],
    ) -> Result<(UnixStream, ResponseHead, BytesMut), RelayError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| RelayError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        stream.write_all(payload).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        loop {
            if let Some(end) = find_head_end(&buffer) {
                let raw = buffer.split_to(end + 4).freeze();
                let head = ResponseHead::parse(raw)?;

                // Interim responses are consumed, not relayed.
                if head.is_interim() {
                    continue;
                }
                return Ok((stream, head, buffer));
            }

            // Prevent unbounded header growth
            if buffer.len() > MAX_RESPONSE_HEAD_BYTES {
                return Err(RelayError::MalformedResponse("response head too large"));
            }

            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 {
                return Err(RelayError::MalformedResponse(
                    "connection closed before response head",
                ));
            }
        }
    }
}

/// How the end of the upstream response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// The body runs until the upstream closes the connection.
    UntilClose,
}

struct ResponseHead {
    raw: Bytes,
    status: u16,
    framing: BodyFraming,
}

impl ResponseHead {
    fn parse(raw: Bytes) -> Result<Self, RelayError> {
        let text = std::str::from_utf8(&raw)
            .map_err(|_| RelayError::MalformedResponse("response head is not UTF-8"))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(RelayError::MalformedResponse("invalid status line"));
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .filter(|code| (100..600).contains(code))
            .ok_or(RelayError::MalformedResponse("invalid status code"))?;

        let mut content_length = None;
        let mut chunked = false;
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("Content-Length") {
                let length = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| RelayError::MalformedResponse("invalid Content-Length"))?;
                content_length = Some(length);
            } else if key.eq_ignore_ascii_case("Transfer-Encoding") {
                chunked = true;
            }
        }

        let framing = match status {
            101 => BodyFraming::UntilClose,
            100..=199 | 204 | 304 => BodyFraming::Length(0),
            _ if chunked => BodyFraming::UntilClose,
            _ => content_length.map_or(BodyFraming::UntilClose, BodyFraming::Length),
        };

        Ok(Self { raw, status, framing })
    }

    fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// An upstream response whose head has arrived and whose body is pending.
pub struct UpstreamResponse {
    stream: UnixStream,
    raw_head: Bytes,
    status: u16,
    framing: BodyFraming,
    /// Body bytes read together with the head.
    buffered: BytesMut,
    deadline: Instant,
    timeout: Duration,
}

impl UpstreamResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Copies the response to `client` verbatim, status line first.
    ///
    /// Returns whether the client connection can carry another request,
    /// which is only the case for length-delimited bodies. On error the
    /// client may have received part of the response and must be closed.
    pub async fn relay_to<W>(self, client: &mut W) -> Result<bool, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let deadline = self.deadline;
        let timeout = self.timeout;

        timeout_at(deadline, self.copy_to(client))
            .await
            .map_err(|_| RelayError::Timeout(timeout))?
    }

    async fn copy_to<W>(mut self, client: &mut W) -> Result<bool, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        client.write_all(&self.raw_head).await?;

        let reusable = match self.framing {
            BodyFraming::Length(length) => {
                let from_buffer = (self.buffered.len() as u64).min(length);
                client
                    .write_all(&self.buffered[..from_buffer as usize])
                    .await?;

                let remaining = length - from_buffer;
                let mut body = (&mut self.stream).take(remaining);
                let copied = tokio::io::copy(&mut body, client).await?;
                if copied < remaining {
                    return Err(RelayError::MalformedResponse(
                        "connection closed before complete body",
                    ));
                }
                true
            }
            BodyFraming::UntilClose => {
                client.write_all(&self.buffered).await?;
                tokio::io::copy(&mut self.stream, client).await?;
                false
            }
        };

        client.flush().await?;
        Ok(reusable)
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}
