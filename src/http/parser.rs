use crate::http::request::{Method, Request};
use thiserror::Error;

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a decoded request body.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound on the chunked encoding of a body, framing included.
const MAX_CHUNKED_BYTES: usize = 2 * MAX_BODY_BYTES;

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE_BYTES: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("malformed method token")]
    InvalidMethod,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    InvalidTransferEncoding,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("request head exceeds 64 KiB")]
    HeadTooLarge,
    #[error("request body exceeds 8 MiB")]
    BodyTooLarge,
    #[error("incomplete request")]
    Incomplete,
}

/// How the end of a request body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(usize),
    Chunked,
}

/// A parsed request line and header block whose body may still be in flight.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The request with an empty body.
    pub request: Request,
    pub framing: Framing,
    /// Bytes taken by the head, blank line included.
    pub len: usize,
}

impl RequestHead {
    pub fn into_request(self, body: Vec<u8>) -> Request {
        Request { body, ..self.request }
    }
}

/// Parses a complete request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let head = parse_request_head(buf)?;
    let (body, body_consumed) = parse_body(head.framing, &buf[head.len..])?;
    let consumed = head.len + body_consumed;

    Ok((head.into_request(body), consumed))
}

/// Parses the request line and headers, leaving the body alone.
///
/// A declared `Content-Length` above [`MAX_BODY_BYTES`] is refused here,
/// before any of the body has to be buffered.
pub fn parse_request_head(buf: &[u8]) -> Result<RequestHead, ParseError> {
    // Look for header/body separator
    let headers_end = match find_headers_end(buf) {
        Some(end) if end > MAX_HEAD_BYTES => return Err(ParseError::HeadTooLarge),
        Some(end) => end,
        None if buf.len() > MAX_HEAD_BYTES => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    let header_bytes = &buf[..headers_end];

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    if parts.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    // Headers, kept in arrival order
    let mut headers = Vec::new();
    let mut content_length: Option<usize> = None;
    let mut chunked = false;

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(ParseError::InvalidHeader);
        }

        if key.eq_ignore_ascii_case("Content-Length") {
            let length = value
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)?;
            if content_length.is_some_and(|seen| seen != length) {
                return Err(ParseError::InvalidContentLength);
            }
            content_length = Some(length);
        } else if key.eq_ignore_ascii_case("Transfer-Encoding") {
            // Only a final `chunked` coding tells us where the body ends.
            let last = value.rsplit(',').next().unwrap_or_default().trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ParseError::InvalidTransferEncoding);
            }
            chunked = true;
        }

        headers.push((key.to_string(), value.to_string()));
    }

    let framing = match (chunked, content_length) {
        (true, Some(_)) => return Err(ParseError::InvalidRequest),
        (true, None) => Framing::Chunked,
        (false, Some(length)) if length > MAX_BODY_BYTES => {
            return Err(ParseError::BodyTooLarge);
        }
        (false, length) => Framing::Length(length.unwrap_or(0)),
    };

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body: Vec::new(),
    };

    Ok(RequestHead {
        request,
        framing,
        len: headers_end + 4,
    })
}

/// Extracts a body framed by `framing` from the front of `buf`.
///
/// Returns the decoded body and the number of bytes consumed.
pub fn parse_body(framing: Framing, buf: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    match framing {
        Framing::Length(length) if length > MAX_BODY_BYTES => Err(ParseError::BodyTooLarge),
        Framing::Length(length) if buf.len() < length => Err(ParseError::Incomplete),
        Framing::Length(length) => Ok((buf[..length].to_vec(), length)),
        Framing::Chunked => match decode_chunked(buf) {
            Err(ParseError::Incomplete) if buf.len() > MAX_CHUNKED_BYTES => {
                Err(ParseError::BodyTooLarge)
            }
            other => other,
        },
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
}

fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decodes a chunked body, returning the payload and the bytes consumed
/// (trailers included).
fn decode_chunked(buf: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_end) = find_line_end(&buf[pos..]) else {
            if buf.len() - pos > MAX_CHUNK_LINE_BYTES {
                return Err(ParseError::InvalidChunk);
            }
            return Err(ParseError::Incomplete);
        };
        let size_line = std::str::from_utf8(&buf[pos..pos + line_end])
            .map_err(|_| ParseError::InvalidChunk)?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        if size_hex.is_empty() || !size_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidChunk);
        }
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| ParseError::InvalidChunk)?;
        pos += line_end + 2;

        if size > MAX_BODY_BYTES - body.len() {
            return Err(ParseError::BodyTooLarge);
        }

        if size == 0 {
            // Skip trailers up to the terminating empty line.
            loop {
                let end = find_line_end(&buf[pos..]).ok_or(ParseError::Incomplete)?;
                pos += end + 2;
                if end == 0 {
                    return Ok((body, pos));
                }
            }
        }

        let data_end = pos.checked_add(size).ok_or(ParseError::InvalidChunk)?;
        let chunk_end = data_end.checked_add(2).ok_or(ParseError::InvalidChunk)?;
        if buf.len() < chunk_end {
            return Err(ParseError::Incomplete);
        }
        if &buf[data_end..chunk_end] != b"\r\n" {
            return Err(ParseError::InvalidChunk);
        }

        body.extend_from_slice(&buf[pos..data_end]);
        pos = chunk_end;
    }
}
