//! Message body framing
//!
//! Decides from the headers how a body is delimited (Content-Length, chunked
//! transfer-coding or connection close), exposes the incoming body as a
//! bounded `Read`, and writes outgoing bodies with the matching framing.

use super::chunked::{ChunkedEncoder, ChunkedReader};
use super::{Error, Headers, Method, Result, Status, Version};
use bytes::{Buf, Bytes};
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Declared length of a message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyLength {
    /// No body at all
    #[default]
    None,
    /// Exactly this many bytes
    Known(u64),
    /// Length not known up front (chunked or close-delimited)
    Unknown,
}

impl BodyLength {
    pub fn known(&self) -> Option<u64> {
        match self {
            BodyLength::None => Some(0),
            BodyLength::Known(n) => Some(*n),
            BodyLength::Unknown => None,
        }
    }
}

/// How the bytes of one body are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Zero-length body, no framing header
    Empty,
    /// `Content-Length: n`
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Body runs until the connection closes
    UntilClose,
}

enum Inner<'a> {
    Empty,
    Bytes(Bytes),
    Fixed {
        reader: &'a mut dyn BufRead,
        remaining: u64,
    },
    Chunked(ChunkedReader<&'a mut dyn BufRead>),
    UntilClose(&'a mut dyn BufRead),
    Reader(Box<dyn Read + 'a>),
}

/// A message body stream
///
/// Incoming bodies borrow the connection reader and stop exactly at the end
/// of the framed body, so the next message on the connection can be parsed
/// once the body is drained. Outgoing bodies are built from bytes or from any
/// reader.
pub struct Body<'a> {
    inner: Inner<'a>,
}

impl<'a> Body<'a> {
    pub fn empty() -> Self {
        Body { inner: Inner::Empty }
    }

    /// In-memory body; its length is known.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Body {
            inner: Inner::Bytes(Bytes::from(data.into())),
        }
    }

    /// Streaming body of unknown length
    pub fn from_reader(reader: impl Read + 'a) -> Self {
        Body {
            inner: Inner::Reader(Box::new(reader)),
        }
    }

    pub(crate) fn incoming(reader: &'a mut dyn BufRead, framing: Framing) -> Self {
        let inner = match framing {
            Framing::Empty | Framing::Length(0) => Inner::Empty,
            Framing::Length(n) => Inner::Fixed {
                reader,
                remaining: n,
            },
            Framing::Chunked => Inner::Chunked(ChunkedReader::new(reader)),
            Framing::UntilClose => Inner::UntilClose(reader),
        };
        Body { inner }
    }

    /// Bytes left, when that is known without reading
    pub fn known_len(&self) -> Option<u64> {
        match &self.inner {
            Inner::Empty => Some(0),
            Inner::Bytes(b) => Some(b.len() as u64),
            Inner::Fixed { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.known_len() == Some(0)
    }

    /// Trailer fields of a chunked body that has been read to the end
    pub fn trailers(&self) -> Option<&Headers> {
        match &self.inner {
            Inner::Chunked(c) if c.is_complete() => Some(c.trailers()),
            _ => None,
        }
    }

    /// Read the rest of the body into memory
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Discard at most `limit` bytes. Returns whether the body reached its
    /// end within that budget.
    pub fn drain(&mut self, limit: u64) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        let discarded = io::copy(&mut self.by_ref().take(limit.saturating_add(1)), &mut io::sink())?;
        Ok(discarded <= limit)
    }
}

impl Read for Body<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Empty => Ok(0),
            Inner::Bytes(b) => {
                let n = b.len().min(buf.len());
                b.copy_to_slice(&mut buf[..n]);
                Ok(n)
            }
            Inner::Fixed { reader, remaining } => {
                if *remaining == 0 || buf.is_empty() {
                    return Ok(0);
                }
                let max = (*remaining).min(buf.len() as u64) as usize;
                let n = reader.read(&mut buf[..max])?;
                if n == 0 {
                    return Err(Error::UnexpectedEof.into_io());
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Inner::Chunked(c) => c.read(buf),
            Inner::UntilClose(r) => r.read(buf),
            Inner::Reader(r) => r.read(buf),
        }
    }
}

impl Default for Body<'_> {
    fn default() -> Self {
        Body::empty()
    }
}

impl fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            Inner::Empty => "empty",
            Inner::Bytes(_) => "bytes",
            Inner::Fixed { .. } => "fixed",
            Inner::Chunked(_) => "chunked",
            Inner::UntilClose(_) => "until-close",
            Inner::Reader(_) => "reader",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("known_len", &self.known_len())
            .finish()
    }
}

impl From<Vec<u8>> for Body<'_> {
    fn from(data: Vec<u8>) -> Self {
        Body::from_bytes(data)
    }
}

impl From<&[u8]> for Body<'_> {
    fn from(data: &[u8]) -> Self {
        Body::from_bytes(data)
    }
}

impl From<String> for Body<'_> {
    fn from(data: String) -> Self {
        Body::from_bytes(data)
    }
}

impl From<&str> for Body<'_> {
    fn from(data: &str) -> Self {
        Body::from_bytes(data)
    }
}

impl From<Bytes> for Body<'_> {
    fn from(data: Bytes) -> Self {
        Body {
            inner: Inner::Bytes(data),
        }
    }
}

/// Caps the number of bytes read from an incoming body.
///
/// Reading past the limit fails with `BodyTooLarge`, and keeps failing on
/// every later read. An optional shared flag is raised at that point so the
/// response side knows the connection cannot be reused.
pub struct MaxBytesReader<R> {
    inner: R,
    remaining: u64,
    limit: u64,
    exceeded: bool,
    signal: Option<Arc<AtomicBool>>,
}

impl<R: Read> MaxBytesReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        MaxBytesReader {
            inner,
            remaining: limit,
            limit,
            exceeded: false,
            signal: None,
        }
    }

    /// Raise `signal` when the limit is exceeded
    pub fn with_signal(inner: R, limit: u64, signal: Arc<AtomicBool>) -> Self {
        MaxBytesReader {
            signal: Some(signal),
            ..MaxBytesReader::new(inner, limit)
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn trip(&mut self) {
        self.exceeded = true;
        if let Some(signal) = &self.signal {
            signal.store(true, Ordering::Release);
        }
    }
}

impl<R: Read> Read for MaxBytesReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exceeded {
            return Err(Error::BodyTooLarge.into_io());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        // One byte past the limit tells "exactly at limit" from "over".
        let max = (self.remaining.saturating_add(1)).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n as u64 <= self.remaining {
            self.remaining -= n as u64;
            return Ok(n);
        }
        let allowed = self.remaining as usize;
        self.remaining = 0;
        self.trip();
        if allowed == 0 {
            return Err(Error::BodyTooLarge.into_io());
        }
        Ok(allowed)
    }
}

/// Parse a Content-Length value: non-negative decimal digits only.
pub(crate) fn parse_content_length(value: &str) -> Result<u64> {
    let value = value.trim_matches([' ', '\t']);
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidContentLength(value.to_string()));
    }
    value
        .parse()
        .map_err(|_| Error::InvalidContentLength(value.to_string()))
}

/// Resolve the framing of an incoming message from its headers.
///
/// A chunked Transfer-Encoding wins over Content-Length, and the now
/// meaningless Content-Length header is dropped. `response` carries the
/// status and the method of the request being answered, for responses.
pub(crate) fn incoming_framing(
    headers: &mut Headers,
    version: Version,
    response: Option<(Status, &Method)>,
) -> Result<(Framing, BodyLength)> {
    let mut chunked = false;
    if headers.contains("Transfer-Encoding") {
        if version.at_least(1, 1) {
            let codings = headers.values("Transfer-Encoding");
            if codings.len() != 1 || !codings[0].trim().eq_ignore_ascii_case("chunked") {
                return Err(Error::UnsupportedTransferEncoding(codings.join(", ")));
            }
            chunked = true;
            headers.remove("Content-Length");
        } else {
            headers.remove("Transfer-Encoding");
        }
    }

    let mut content_length = None;
    let values = headers.values("Content-Length");
    if let Some(first) = values.first() {
        let first = first.trim();
        if values.iter().any(|v| v.trim() != first) {
            return Err(Error::InvalidContentLength(values.join(", ")));
        }
        content_length = Some(parse_content_length(first)?);
    }

    if let Some((status, method)) = response {
        if !status.allows_body() || *method == Method::Head {
            let length = match content_length {
                Some(n) => BodyLength::Known(n),
                None if chunked => BodyLength::Unknown,
                None => BodyLength::None,
            };
            return Ok((Framing::Empty, length));
        }
    }

    if chunked {
        return Ok((Framing::Chunked, BodyLength::Unknown));
    }
    match (content_length, response) {
        (Some(n), _) => Ok((Framing::Length(n), BodyLength::Known(n))),
        (None, Some(_)) => Ok((Framing::UntilClose, BodyLength::Unknown)),
        (None, None) => Ok((Framing::Empty, BodyLength::None)),
    }
}

/// Whether the sender of a message with these headers wants the connection
/// closed after it.
pub(crate) fn should_close(version: Version, headers: &Headers) -> bool {
    if version.major() < 1 {
        return true;
    }
    if !version.at_least(1, 1) {
        return !headers.has_token("Connection", "keep-alive");
    }
    headers.has_token("Connection", "close")
}

/// Framing used to send a request body.
pub(crate) fn request_framing(method: &Method, length: BodyLength, body: &Body<'_>) -> Framing {
    match length {
        BodyLength::Known(n) if n > 0 => Framing::Length(n),
        BodyLength::Unknown if !body.is_empty() => Framing::Chunked,
        _ if method.has_form_body() => Framing::Length(0),
        _ => Framing::Empty,
    }
}

/// Framing used to send a response body.
pub(crate) fn response_framing(
    status: Status,
    version: Version,
    length: BodyLength,
    body: &Body<'_>,
) -> Framing {
    if !status.allows_body() {
        return Framing::Empty;
    }
    match length {
        BodyLength::Known(n) => Framing::Length(n),
        BodyLength::Unknown if body.is_empty() => Framing::Length(0),
        BodyLength::Unknown if version.at_least(1, 1) => Framing::Chunked,
        BodyLength::Unknown => Framing::UntilClose,
        BodyLength::None => Framing::Length(0),
    }
}

pub(crate) fn write_framing_headers(sink: &mut dyn Write, framing: Framing) -> io::Result<()> {
    match framing {
        Framing::Length(n) => write!(sink, "Content-Length: {}\r\n", n),
        Framing::Chunked => sink.write_all(b"Transfer-Encoding: chunked\r\n"),
        Framing::Empty | Framing::UntilClose => Ok(()),
    }
}

/// Copy `body` to `sink` with the given framing.
///
/// With a declared length the whole body is consumed so a body longer or
/// shorter than declared fails with `ContentLengthMismatch`.
pub(crate) fn write_body(sink: &mut dyn Write, body: &mut Body<'_>, framing: Framing) -> Result<()> {
    match framing {
        Framing::Empty | Framing::Length(_) => {
            let declared = match framing {
                Framing::Length(n) => n,
                _ => 0,
            };
            let copied = io::copy(&mut body.by_ref().take(declared), &mut *sink)?;
            let extra = io::copy(body, &mut io::sink())?;
            if copied != declared || extra != 0 {
                return Err(Error::ContentLengthMismatch {
                    declared,
                    actual: copied + extra,
                });
            }
        }
        Framing::Chunked => {
            let mut encoder = ChunkedEncoder::new(&mut *sink);
            io::copy(body, &mut encoder)?;
            encoder.finish()?;
        }
        Framing::UntilClose => {
            io::copy(body, &mut *sink)?;
        }
    }
    sink.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framing_of(raw: &str, version: Version) -> Result<(Framing, BodyLength)> {
        let mut headers = Headers::new();
        for line in raw.lines().filter(|l| !l.is_empty()) {
            let (name, value) = Headers::parse_header_line(line)?;
            headers.add(name, value);
        }
        incoming_framing(&mut headers, version, None)
    }

    #[test]
    fn test_fixed_body_stops_at_length() {
        let mut conn: &[u8] = b"abcdefNEXT";
        let mut body = Body::incoming(&mut conn, Framing::Length(6));
        assert_eq!(body.known_len(), Some(6));
        assert_eq!(body.read_to_vec().unwrap(), b"abcdef");
        drop(body);
        assert_eq!(conn, b"NEXT");
    }

    #[test]
    fn test_shared_bytes_body() {
        let data = Bytes::from_static(b"hello world");
        let mut body = Body::from(data.slice(6..));
        assert_eq!(body.known_len(), Some(5));

        let mut buf = [0u8; 3];
        assert_eq!(body.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"wor");
        assert_eq!(body.known_len(), Some(2));
        assert_eq!(body.read_to_vec().unwrap(), b"ld");
        assert!(body.is_empty());
        assert_eq!(data.len(), 11);
    }

    #[test]
    fn test_fixed_body_premature_eof() {
        let mut conn: &[u8] = b"abc";
        let mut body = Body::incoming(&mut conn, Framing::Length(10));
        let err = body.read_to_vec().unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }

    #[test]
    fn test_chunked_body_and_trailers() {
        let mut conn: &[u8] = b"3\r\nabc\r\n0\r\nX-T: 1\r\n\r\n";
        let mut body = Body::incoming(&mut conn, Framing::Chunked);
        assert!(body.trailers().is_none());
        assert_eq!(body.read_to_vec().unwrap(), b"abc");
        assert_eq!(body.trailers().unwrap().get("X-T"), Some("1"));
    }

    #[test]
    fn test_drain() {
        let mut conn: &[u8] = b"0123456789";
        let mut body = Body::incoming(&mut conn, Framing::Length(10));
        assert!(!body.drain(4).unwrap());

        let mut conn: &[u8] = b"0123456789";
        let mut body = Body::incoming(&mut conn, Framing::Length(10));
        assert!(body.drain(10).unwrap());
        assert!(body.is_empty());
    }

    #[test]
    fn test_max_bytes_reader_at_limit() {
        let mut reader = MaxBytesReader::new(&b"12345"[..], 5);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"12345");
        assert!(!reader.exceeded());
    }

    #[test]
    fn test_max_bytes_reader_over_limit_is_sticky() {
        let signal = Arc::new(AtomicBool::new(false));
        let mut reader = MaxBytesReader::with_signal(&b"123456789"[..], 4, signal.clone());
        let mut buf = [0u8; 64];

        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"1234");
        assert!(signal.load(Ordering::Acquire));
        for _ in 0..2 {
            let err = Error::from(reader.read(&mut buf).unwrap_err());
            assert!(matches!(err, Error::BodyTooLarge));
        }
    }

    #[test]
    fn test_incoming_framing_content_length() {
        let (framing, length) = framing_of("Content-Length: 3", Version::HTTP_11).unwrap();
        assert_eq!(framing, Framing::Length(3));
        assert_eq!(length, BodyLength::Known(3));

        let (framing, _) = framing_of("Content-Length: 3\nContent-Length: 3", Version::HTTP_11).unwrap();
        assert_eq!(framing, Framing::Length(3));

        for bad in ["Content-Length: 3\nContent-Length: 4", "Content-Length: -1", "Content-Length: 1e3"] {
            let err = framing_of(bad, Version::HTTP_11).unwrap_err();
            assert!(matches!(err, Error::InvalidContentLength(_)), "{bad}");
        }

        let (framing, length) = framing_of("Accept: */*", Version::HTTP_11).unwrap();
        assert_eq!(framing, Framing::Empty);
        assert_eq!(length, BodyLength::None);
    }

    #[test]
    fn test_incoming_framing_chunked_wins() {
        let mut headers = Headers::new();
        headers.set("Transfer-Encoding", "chunked");
        headers.set("Content-Length", "999");
        let (framing, length) = incoming_framing(&mut headers, Version::HTTP_11, None).unwrap();
        assert_eq!(framing, Framing::Chunked);
        assert_eq!(length, BodyLength::Unknown);
        assert!(!headers.contains("Content-Length"));

        let err = framing_of("Transfer-Encoding: gzip", Version::HTTP_11).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransferEncoding(_)));

        // HTTP/1.0 does not know transfer codings
        let (framing, _) = framing_of("Transfer-Encoding: chunked\nContent-Length: 2", Version::HTTP_10).unwrap();
        assert_eq!(framing, Framing::Length(2));
    }

    #[test]
    fn test_incoming_framing_responses() {
        let mut headers = Headers::new();
        let (framing, _) =
            incoming_framing(&mut headers, Version::HTTP_11, Some((Status::OK, &Method::Get))).unwrap();
        assert_eq!(framing, Framing::UntilClose);

        headers.set("Content-Length", "42");
        let (framing, length) =
            incoming_framing(&mut headers, Version::HTTP_11, Some((Status::OK, &Method::Head))).unwrap();
        assert_eq!(framing, Framing::Empty);
        assert_eq!(length, BodyLength::Known(42));

        let (framing, _) =
            incoming_framing(&mut headers, Version::HTTP_11, Some((Status::NOT_MODIFIED, &Method::Get)))
                .unwrap();
        assert_eq!(framing, Framing::Empty);
    }

    #[test]
    fn test_should_close() {
        let mut headers = Headers::new();
        assert!(!should_close(Version::HTTP_11, &headers));
        assert!(should_close(Version::HTTP_10, &headers));

        headers.set("Connection", "Keep-Alive");
        assert!(!should_close(Version::HTTP_10, &headers));

        headers.set("Connection", "close");
        assert!(should_close(Version::HTTP_11, &headers));
    }

    #[test]
    fn test_request_framing() {
        let empty = Body::empty();
        let data = Body::from("abc");
        assert_eq!(request_framing(&Method::Get, BodyLength::None, &empty), Framing::Empty);
        assert_eq!(request_framing(&Method::Post, BodyLength::None, &empty), Framing::Length(0));
        assert_eq!(request_framing(&Method::Put, BodyLength::Known(3), &data), Framing::Length(3));
        assert_eq!(request_framing(&Method::Post, BodyLength::Unknown, &data), Framing::Chunked);
        assert_eq!(request_framing(&Method::Get, BodyLength::Unknown, &empty), Framing::Empty);
    }

    #[test]
    fn test_response_framing() {
        let empty = Body::empty();
        let stream = Body::from_reader(&b"xyz"[..]);
        assert_eq!(
            response_framing(Status::OK, Version::HTTP_11, BodyLength::None, &empty),
            Framing::Length(0)
        );
        assert_eq!(
            response_framing(Status::NO_CONTENT, Version::HTTP_11, BodyLength::None, &empty),
            Framing::Empty
        );
        assert_eq!(
            response_framing(Status::OK, Version::HTTP_11, BodyLength::Unknown, &stream),
            Framing::Chunked
        );
        assert_eq!(
            response_framing(Status::OK, Version::HTTP_10, BodyLength::Unknown, &stream),
            Framing::UntilClose
        );
    }

    #[test]
    fn test_write_body_chunked() {
        let mut out = Vec::new();
        let mut body = Body::from_reader(&b"abcdef"[..]);
        write_framing_headers(&mut out, Framing::Chunked).unwrap();
        write_body(&mut out, &mut body, Framing::Chunked).unwrap();
        assert_eq!(out, b"Transfer-Encoding: chunked\r\n6\r\nabcdef\r\n0\r\n\r\n");
    }

    #[test]
    fn test_write_body_length_mismatch() {
        let mut out = Vec::new();
        let mut body = Body::from("abc");
        let err = write_body(&mut out, &mut body, Framing::Length(5)).unwrap_err();
        assert!(matches!(err, Error::ContentLengthMismatch { declared: 5, actual: 3 }));

        let mut out = Vec::new();
        let mut body = Body::from("abcdefg");
        let err = write_body(&mut out, &mut body, Framing::Length(5)).unwrap_err();
        assert!(matches!(err, Error::ContentLengthMismatch { declared: 5, actual: 7 }));

        let mut out = Vec::new();
        let mut body = Body::from("abc");
        write_body(&mut out, &mut body, Framing::Length(3)).unwrap();
        assert_eq!(out, b"abc");
    }
}
