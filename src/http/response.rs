//! Response header blocks and minimal status responses

use crate::{
    http::types::{self, StatusCode, Version},
    queue::ByteQueue,
    server::handler::{Action, Context, Protocol},
    socket::SocketIo,
};
use bytes::Bytes;

/// A response header block viewed in place.
///
/// Used on the relay path, where the block has already been decoded to
/// text: every field is a range into the borrowed `str` and lookups index
/// it directly.
///
/// ```
/// use connpool::http::ResponseHeader;
///
/// let head = ResponseHeader::parse("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
/// assert!(head.is_valid());
/// assert_eq!(head.status(), 404);
/// assert_eq!(head.reason(), "Not Found");
/// assert_eq!(head.header("content-length"), Some("0"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader<'a> {
    text: &'a str,
    version: Option<Version>,
    status: u16,
    reason: (usize, usize),
    fields: usize,
}

impl<'a> ResponseHeader<'a> {
    pub fn parse(text: &'a str) -> Self {
        let mut head = ResponseHeader {
            text,
            version: None,
            status: 0,
            reason: (0, 0),
            fields: 0,
        };

        let bytes = text.as_bytes();
        let Some(line_end) = find_crlf(bytes, 0) else {
            return head;
        };

        // "HTTP/1.1 200 OK": version, status and reason sit at fixed offsets.
        let version = bytes.get(..8).and_then(Version::from_bytes);
        let separated = match line_end {
            12 => true,
            13.. => bytes.get(12) == Some(&b' '),
            _ => false,
        };
        let status = match bytes.get(8) {
            Some(b' ') if separated => bytes.get(9..12).and_then(types::slice_to_usize),
            _ => None,
        };

        if let (Some(version), Some(status @ 100..=999)) = (version, status) {
            head.version = Some(version);
            head.status = status as u16;
            head.reason = (line_end.min(13), line_end);
            head.fields = line_end + 2;
        }
        head
    }

    /// Decodes `bytes` as UTF-8 first; `None` when that fails.
    #[inline]
    pub fn from_bytes(bytes: &'a [u8]) -> Option<Self> {
        simdutf8::basic::from_utf8(bytes).ok().map(Self::parse)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.version.is_some()
    }

    #[inline]
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// The status code, `0` for an invalid block.
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[inline]
    pub fn reason(&self) -> &'a str {
        self.text.get(self.reason.0..self.reason.1).unwrap_or_default()
    }

    /// First header called `name` (ASCII, any case), whitespace trimmed.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        if !self.is_valid() {
            return None;
        }

        let text = self.text;
        let bytes = text.as_bytes();
        let name = name.as_bytes();
        let mut start = self.fields;

        loop {
            let end = find_crlf(bytes, start)?;
            if end == start {
                return None;
            }

            let colon = start + name.len();
            if colon < end
                && bytes.get(colon) == Some(&b':')
                && types::eq_ignore_case(&bytes[start..colon], name)
            {
                return text.get(colon + 1..end).map(|value| value.trim_matches([' ', '\t']));
            }
            start = end + 2;
        }
    }

    #[inline]
    pub fn content_length(&self) -> Option<usize> {
        types::slice_to_usize(self.header("content-length")?.as_bytes())
    }
}

#[inline]
fn find_crlf(bytes: &[u8], from: usize) -> Option<usize> {
    let rest = bytes.get(from..)?;
    memchr::memmem::find(rest, b"\r\n").map(|pos| from + pos)
}

/// Appends a complete response with a `text/plain` body to `tx`.
pub fn write_status(tx: &mut ByteQueue, version: Version, status: StatusCode, body: &[u8], close: bool) {
    tx.add(status.into_first_line(version));
    tx.add(b"Content-Type: text/plain\r\nContent-Length: ");
    tx.add(body.len().to_string().as_bytes());
    if close {
        tx.add(b"\r\nConnection: close");
    }
    tx.add(b"\r\n\r\n");
    tx.add(body);
}

/// Writes one status response and gives the connection back.
///
/// As a delegate it returns control to the outer handler once the response
/// is flushed; as a top-level handler it disconnects.
///
/// [`respond`](Self::respond) changes the response for one run only; a
/// pooled responder goes back to the response it was built with.
#[derive(Debug, Clone)]
pub struct StatusResponder {
    current: Reply,
    configured: Reply,
}

#[derive(Debug, Clone)]
struct Reply {
    status: StatusCode,
    version: Version,
    body: Bytes,
}

impl StatusResponder {
    /// Responds with `status` and its reason phrase as body.
    pub fn new(status: StatusCode) -> Self {
        Self::with_body(status, Version::Http11, status.reason())
    }

    pub fn with_body(status: StatusCode, version: Version, body: impl Into<Bytes>) -> Self {
        let reply = Reply {
            status,
            version,
            body: body.into(),
        };
        Self {
            current: reply.clone(),
            configured: reply,
        }
    }

    /// Replaces the response for the next run.
    pub fn respond(&mut self, status: StatusCode, version: Version, body: impl Into<Bytes>) {
        self.current = Reply {
            status,
            version,
            body: body.into(),
        };
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.current.status
    }
}

impl Default for StatusResponder {
    fn default() -> Self {
        Self::new(StatusCode::ServiceUnavailable)
    }
}

impl Protocol for StatusResponder {
    fn initialize<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        let close = !cx.is_delegated();
        let reply = &self.current;
        write_status(cx.tx(), reply.version, reply.status, &reply.body, close);
        Action::Send
    }

    fn receive<S: SocketIo>(&mut self, _: &mut Context<'_, S>) -> Action {
        Action::Disconnect
    }

    fn send<S: SocketIo>(&mut self, cx: &mut Context<'_, S>) -> Action {
        if cx.is_delegated() {
            Action::ReleaseControl
        } else {
            Action::Disconnect
        }
    }

    fn reset(&mut self) {
        self.current = self.configured.clone();
    }
}
