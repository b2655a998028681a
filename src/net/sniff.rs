//! First-request sniffing at the connection level.
//!
//! The head of the first request on every connection is read before any
//! HTTP machinery sees the socket, so protocol upgrades can be handed to the
//! upgrade dispatcher with their raw bytes intact.

use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use crate::security::headers::has_token;

/// HTTP/2 prior-knowledge connection preface.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("I/O error while reading request head: {0}")]
    Io(#[from] std::io::Error),

    #[error("client did not send a request head in time")]
    Timeout,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("unparsable request head: {0}")]
    Malformed(#[from] httparse::Error),
}

/// One header exactly as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub value: Vec<u8>,
}

/// Parsed request line and headers of an HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target including any query string.
    pub target: String,
    /// Minor HTTP version (`1` for HTTP/1.1).
    pub minor_version: u8,
    pub headers: Vec<RawHeader>,
    /// Number of bytes the head occupies in the read buffer.
    pub len: usize,
}

impl RequestHead {
    /// Parse a complete head from `buf`; `Ok(None)` means more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        Ok(Some(Self {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            minor_version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| RawHeader {
                    name: h.name.to_string(),
                    value: h.value.to_vec(),
                })
                .collect(),
            len,
        }))
    }

    /// Path component of the request target, without the query.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// All values of `name` (case-insensitive) in arrival order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// `Connection: upgrade` together with an `Upgrade` header.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some() && has_token(self.header_values("connection"), "upgrade")
    }
}

/// What the first bytes of a connection turned out to be.
#[derive(Debug)]
pub enum Sniffed {
    /// The peer closed before sending anything.
    Empty,
    /// HTTP/2 with prior knowledge; there is no HTTP/1 head to inspect.
    Http2Preface,
    Head(RequestHead),
}

/// Read from `stream` into `buf` until a full request head is available.
///
/// Everything read stays in `buf`, including bytes past the head.
pub async fn read_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Sniffed, SniffError>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;

    loop {
        let read = tokio::time::timeout_at(deadline, stream.read_buf(buf))
            .await
            .map_err(|_| SniffError::Timeout)??;

        if read == 0 {
            if buf.is_empty() {
                return Ok(Sniffed::Empty);
            }
            return Err(SniffError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }

        if buf.starts_with(H2_PREFACE) {
            return Ok(Sniffed::Http2Preface);
        }
        let maybe_preface = buf.len() < H2_PREFACE.len() && H2_PREFACE.starts_with(&buf[..]);
        if !maybe_preface {
            if let Some(head) = RequestHead::parse(&buf[..])? {
                return Ok(Sniffed::Head(head));
            }
        }

        if buf.len() >= max_bytes {
            return Err(SniffError::TooLarge(max_bytes));
        }
    }
}
