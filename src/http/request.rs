//! Request header blocks
//!
//! The parser never builds a header map. It records where the request line
//! ends and answers every lookup with a linear scan over the raw block: header
//! blocks are small and a handler looks up only a handful of names.

use crate::http::types::{self, Method, Version};
use bytes::Bytes;
use memchr::{memchr, memchr_iter, memmem};
use std::ops::Range;

/// Returns the length of the header block, terminator included, once the
/// whole block is buffered.
#[inline]
pub fn header_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

/// A parsed request header block.
///
/// Parsing never fails: a block that cannot be interpreted is kept and
/// reported through [`is_valid_request`](Self::is_valid_request) so that the
/// caller decides between an error response and a disconnect.
///
/// # Examples
///
/// ```
/// use connpool::http::RequestHeader;
///
/// let block = b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n";
/// let request = RequestHeader::parse(block, false, 8080);
///
/// assert!(request.is_valid_request());
/// assert_eq!(request.uri(), Some("http://example.com:8080/x"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    block: Bytes,
    method: Range<usize>,
    target: Range<usize>,
    version: Option<Version>,
    // Start of the first header line.
    fields: usize,
    uri: Option<String>,
}

impl RequestHeader {
    /// Parses a header block read from a connection listening on `port`.
    ///
    /// Bytes past the blank line that ends the block are ignored.
    pub fn parse(block: &[u8], tls: bool, port: u16) -> Self {
        let len = header_end(block).unwrap_or(block.len());
        let block = Bytes::copy_from_slice(&block[..len]);

        let mut request = RequestHeader {
            block,
            method: 0..0,
            target: 0..0,
            version: None,
            fields: 0,
            uri: None,
        };

        if request.parse_first_line() && request.fields_well_formed() {
            request.uri = request.build_uri(tls, port);
        }
        request
    }

    fn parse_first_line(&mut self) -> bool {
        let Some(line_end) = find_crlf(&self.block, 0) else {
            return false;
        };
        let line = &self.block[..line_end];

        let mut spaces = memchr_iter(b' ', line);
        let (Some(first), Some(second), None) = (spaces.next(), spaces.next(), spaces.next())
        else {
            return false;
        };

        let method = &line[..first];
        let target = &line[first + 1..second];

        if method.is_empty() || !method.iter().all(|&b| types::is_token(b)) {
            return false;
        }
        if target.is_empty() || !target.iter().all(u8::is_ascii_graphic) {
            return false;
        }

        self.method = 0..first;
        self.target = first + 1..second;
        self.version = Version::from_bytes(&line[second + 1..]);
        self.fields = line_end + 2;

        self.version.is_some()
    }

    fn fields_well_formed(&self) -> bool {
        self.lines().all(|line| match memchr(b':', line) {
            Some(colon) => colon > 0 && line[..colon].iter().all(|&b| types::is_token(b)),
            None => false,
        })
    }

    fn build_uri(&self, tls: bool, port: u16) -> Option<String> {
        let target = self.target_bytes();

        match target {
            [b'/', ..] => {}
            [b'h' | b'H', b't' | b'T', b't' | b'T', b'p' | b'P', b':', b'/', b'/', ..]
            | [b'h' | b'H', b't' | b'T', b't' | b'T', b'p' | b'P', b's' | b'S', b':', b'/', b'/', ..] => {
                return Some(self.target().to_owned());
            }
            _ => return None,
        }

        let host = self.header(b"host")?;
        let authority = Authority::parse(host)?;

        let (scheme, default_port) = if tls { ("https", 443) } else { ("http", 80) };
        let port = authority.port.unwrap_or(port);

        let mut uri = String::with_capacity(scheme.len() + 3 + host.len() + 6 + target.len());
        uri.push_str(scheme);
        uri.push_str("://");
        uri.push_str(&authority.host);
        if port != default_port {
            uri.push(':');
            uri.push_str(&port.to_string());
        }
        uri.push_str(self.target());
        Some(uri)
    }

    /// Header lines between the request line and the blank line.
    fn lines(&self) -> impl Iterator<Item = &[u8]> {
        let block = &self.block[..];
        let mut start = self.fields;

        std::iter::from_fn(move || {
            let end = find_crlf(block, start)?;
            if end == start {
                return None;
            }
            let line = &block[start..end];
            start = end + 2;
            Some(line)
        })
    }

    #[inline]
    fn target_bytes(&self) -> &[u8] {
        &self.block[self.target.clone()]
    }

    /// The method token, or `""` when the request line is malformed.
    #[inline]
    pub fn method(&self) -> &str {
        ascii_str(&self.block[self.method.clone()])
    }

    #[inline]
    pub fn method_kind(&self) -> Option<Method> {
        Method::from_bytes(&self.block[self.method.clone()])
    }

    /// The request target exactly as sent.
    #[inline]
    pub fn target(&self) -> &str {
        ascii_str(self.target_bytes())
    }

    #[inline]
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// The absolute URI, present only for valid requests.
    #[inline]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    #[inline]
    pub fn is_valid_request(&self) -> bool {
        self.uri.is_some()
    }

    /// The raw block, terminator included.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.block
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.block.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// Value of the first header called `name` (ASCII, any case), with
    /// surrounding whitespace removed.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.lines().find_map(|line| {
            let colon = memchr(b':', line)?;
            types::eq_ignore_case(line.get(..colon)?, name)
                .then(|| types::trim_ows(line.get(colon + 1..).unwrap_or_default()))
        })
    }

    /// [`header`](Self::header) decoded as UTF-8.
    #[inline]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        simdutf8::basic::from_utf8(self.header(name.as_bytes())?).ok()
    }

    /// `Content-Length`, when present and numeric.
    #[inline]
    pub fn content_length(&self) -> Option<usize> {
        types::slice_to_usize(self.header(b"content-length")?)
    }

    /// Whether the connection may carry another request after this one.
    pub fn is_keep_alive(&self) -> bool {
        let Some(version) = self.version else {
            return false;
        };

        match self.header(b"connection") {
            Some(value) => value
                .split(|&b| b == b',')
                .map(types::trim_ows)
                .fold(version.keeps_alive(), |keep, option| match option {
                    [b'c' | b'C', b'l' | b'L', b'o' | b'O', b's' | b'S', b'e' | b'E'] => false,
                    [b'k' | b'K', b'e' | b'E', b'e' | b'E', b'p' | b'P', b'-', rest @ ..]
                        if types::eq_ignore_case(rest, b"alive") =>
                    {
                        true
                    }
                    _ => keep,
                }),
            None => version.keeps_alive(),
        }
    }
}

#[inline]
fn find_crlf(block: &[u8], from: usize) -> Option<usize> {
    let rest = block.get(from..)?;
    memchr_iter(b'\n', rest)
        .find(|&pos| pos > 0 && rest[pos - 1] == b'\r')
        .map(|pos| from + pos - 1)
}

#[inline]
fn ascii_str(bytes: &[u8]) -> &str {
    simdutf8::basic::from_utf8(bytes).unwrap_or_default()
}

/// `Host` split into a lowercased host and an optional port.
#[derive(Debug, PartialEq, Eq)]
struct Authority {
    host: String,
    port: Option<u16>,
}

impl Authority {
    fn parse(value: &[u8]) -> Option<Self> {
        let (host, port) = match value {
            [] => return None,
            [b'[', ..] => {
                let close = memchr(b']', value)?;
                let literal = &value[1..close];
                if literal.is_empty() || !literal.iter().all(|&b| b.is_ascii_hexdigit() || b == b':' || b == b'.') {
                    return None;
                }
                match &value[close + 1..] {
                    [] => (&value[..=close], None),
                    [b':', port @ ..] => (&value[..=close], Some(port)),
                    _ => return None,
                }
            }
            _ => {
                let mut colons = memchr_iter(b':', value);
                let (host, port) = match (colons.next(), colons.next()) {
                    (None, _) => (value, None),
                    (Some(colon), None) => (&value[..colon], Some(&value[colon + 1..])),
                    (Some(_), Some(_)) => return None,
                };
                let legal = |b: &u8| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_');
                if host.is_empty() || !host.iter().all(legal) {
                    return None;
                }
                (host, port)
            }
        };

        let port = match port {
            Some(digits) => match types::slice_to_usize(digits)? {
                port @ 1..=65535 => Some(port as u16),
                _ => return None,
            },
            None => None,
        };

        Some(Authority {
            host: ascii_str(host).to_ascii_lowercase(),
            port,
        })
    }
}
