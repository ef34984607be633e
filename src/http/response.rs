//! HTTP responses
//!
//! [`Response`] is the client-side view: parsed from a connection with
//! [`Response::read_from`] or built and serialized with
//! [`Response::write_to`]. [`ResponseWriter`] is what server handlers write
//! into; the connection handler turns it into wire bytes once the handler
//! returns.

use super::body::{self, Body, BodyLength, Framing};
use super::cookie::{self, Cookie};
use super::parser::{parse_status_line, read_line};
use super::request::Request;
use super::{
    Error, Headers, Method, Result, Status, Version, CRLF, DEFAULT_MAX_HEADER_BYTES, TIME_FORMAT,
};
use chrono::Utc;
use log::warn;
use std::io::{self, BufRead, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Headers `write_to` derives from the body instead of copying
const RESPONSE_WRITE_EXCLUDE: &[&str] = &["Content-Length", "Transfer-Encoding", "Trailer"];

/// HTTP response
#[derive(Debug)]
pub struct Response<'a> {
    status: Status,
    reason: String,
    version: Version,
    headers: Headers,
    body: Body<'a>,
    content_length: BodyLength,
    transfer_encoding: Vec<String>,
    close: bool,
}

impl Response<'static> {
    /// Create an empty response with the given status
    pub fn new(status: Status) -> Self {
        Response::builder().status(status).build()
    }
}

impl<'a> Response<'a> {
    /// Create a builder for constructing responses
    pub fn builder() -> ResponseBuilder<'a> {
        ResponseBuilder::default()
    }

    /// Parse the response to a request made with `method`.
    ///
    /// Without Content-Length or chunked framing the body runs until the
    /// connection closes.
    pub fn read_from(reader: &'a mut dyn BufRead, method: &Method) -> Result<Response<'a>> {
        let head = ResponseHead::read_from(&mut *reader, method)?;
        Ok(head.with_body(reader))
    }

    /// Like `read_from`, but skips interim `1xx` responses other than
    /// `101 Switching Protocols`.
    pub fn read_final(reader: &'a mut dyn BufRead, method: &Method) -> Result<Response<'a>> {
        loop {
            let head = ResponseHead::read_from(&mut *reader, method)?;
            if head.status.is_informational() && head.status.code() != 101 {
                continue;
            }
            return Ok(head.with_body(reader));
        }
    }

    /// Serialize the response, consuming its body.
    ///
    /// An unknown length is sent chunked to HTTP/1.1 peers and delimited by
    /// connection close otherwise.
    pub fn write_to(&mut self, sink: &mut dyn Write) -> Result<()> {
        let mut w = BufWriter::new(sink);
        let reason = if self.reason.is_empty() {
            self.status.reason_phrase()
        } else {
            self.reason.as_str()
        };
        write!(w, "{} {} {}{}", self.version, self.status.code(), reason, CRLF)?;

        let framing =
            body::response_framing(self.status, self.version, self.content_length, &self.body);
        body::write_framing_headers(&mut w, framing)?;
        if (self.close || framing == Framing::UntilClose)
            && !self.headers.has_token("Connection", "close")
        {
            write!(w, "Connection: close{}", CRLF)?;
        }
        self.headers.write_to(&mut w, RESPONSE_WRITE_EXCLUDE)?;
        w.write_all(CRLF.as_bytes())?;

        body::write_body(&mut w, &mut self.body, framing)?;
        w.flush()?;
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Reason phrase as received or set
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Body<'a> {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    /// Read the whole body into memory
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        self.body.read_to_vec()
    }

    pub fn content_length(&self) -> BodyLength {
        self.content_length
    }

    pub fn transfer_encoding(&self) -> &[String] {
        &self.transfer_encoding
    }

    /// Whether the connection cannot be reused after this response
    pub fn wants_close(&self) -> bool {
        self.close
    }

    /// Cookies set by the response
    pub fn cookies(&self) -> Vec<Cookie> {
        cookie::read_set_cookies(&self.headers)
    }
}

/// Status line and headers of a response whose body is not attached yet
struct ResponseHead {
    status: Status,
    reason: String,
    version: Version,
    headers: Headers,
    framing: Framing,
    content_length: BodyLength,
    close: bool,
}

impl ResponseHead {
    fn read_from(reader: &mut dyn BufRead, method: &Method) -> Result<ResponseHead> {
        let mut budget = DEFAULT_MAX_HEADER_BYTES;
        let line = read_line(reader, &mut budget)?.ok_or(Error::ConnectionClosed)?;
        let line = String::from_utf8(line)
            .map_err(|e| Error::MalformedStatusLine(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
        let (version, status, reason) = parse_status_line(&line)?;

        let mut headers = Headers::read_from(reader, &mut budget)?;
        let (framing, content_length) =
            body::incoming_framing(&mut headers, version, Some((status, method)))?;
        let close = framing == Framing::UntilClose || body::should_close(version, &headers);

        Ok(ResponseHead {
            status,
            reason,
            version,
            headers,
            framing,
            content_length,
            close,
        })
    }

    fn with_body(self, reader: &mut dyn BufRead) -> Response<'_> {
        let transfer_encoding = if self.framing == Framing::Chunked {
            vec!["chunked".to_string()]
        } else {
            Vec::new()
        };
        Response {
            status: self.status,
            reason: self.reason,
            version: self.version,
            headers: self.headers,
            body: Body::incoming(reader, self.framing),
            content_length: self.content_length,
            transfer_encoding,
            close: self.close,
        }
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct ResponseBuilder<'a> {
    status: Option<Status>,
    reason: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Body<'a>,
    content_length: Option<BodyLength>,
    close: bool,
}

impl<'a> ResponseBuilder<'a> {
    /// Set the status code
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Set a custom reason phrase
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Add a header
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Body<'a>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn content_length(mut self, length: BodyLength) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn close(mut self, close: bool) -> Self {
        self.close = close;
        self
    }

    /// Build the response
    pub fn build(self) -> Response<'a> {
        let status = self.status.unwrap_or(Status::OK);
        let content_length = self.content_length.unwrap_or(match self.body.known_len() {
            Some(0) => BodyLength::None,
            Some(n) => BodyLength::Known(n),
            None => BodyLength::Unknown,
        });
        Response {
            status,
            reason: self
                .reason
                .unwrap_or_else(|| status.reason_phrase().to_string()),
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
            content_length,
            transfer_encoding: Vec::new(),
            close: self.close,
        }
    }
}

/// Response under construction by a server handler.
///
/// The body is buffered; status line and headers are produced by
/// [`ResponseWriter::finish`] once the handler is done, with `Date`,
/// `Content-Length` and `Connection` filled in.
#[derive(Debug)]
pub struct ResponseWriter {
    method: Method,
    version: Version,
    headers: Headers,
    status: Option<Status>,
    body: Vec<u8>,
    close: bool,
    body_limit: Option<Arc<AtomicBool>>,
}

impl ResponseWriter {
    /// Writer answering a request made with `method` over `version`
    pub fn new(method: Method, version: Version) -> Self {
        ResponseWriter {
            method,
            version,
            headers: Headers::new(),
            status: None,
            body: Vec::new(),
            close: false,
            body_limit: None,
        }
    }

    pub(crate) fn for_request(request: &Request<'_>) -> Self {
        let mut writer = ResponseWriter::new(request.method().clone(), request.version());
        writer.close = request.wants_close();
        writer
    }

    /// Response headers; changes after the handler returns are not sent
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Status chosen so far, if any
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Buffered body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Set the status. Only the first call has an effect; later calls log a
    /// warning.
    pub fn write_header(&mut self, status: Status) {
        if let Some(current) = self.status {
            warn!(
                "superfluous write_header call ({} after {})",
                status.code(),
                current.code()
            );
            return;
        }
        self.status = Some(status);
    }

    /// Reply with a plain-text error message. Nothing written before is kept.
    pub fn send_error(&mut self, status: Status, message: &str) {
        self.headers.remove("Content-Length");
        self.headers.set("Content-Type", "text/plain; charset=utf-8");
        self.headers.set("X-Content-Type-Options", "nosniff");
        self.write_header(status);
        self.body.clear();
        if status.allows_body() {
            self.body.extend_from_slice(message.as_bytes());
            self.body.push(b'\n');
        }
    }

    /// Add a Set-Cookie header. Cookies with an invalid name are dropped.
    pub fn set_cookie(&mut self, cookie: &Cookie) {
        let value = cookie.to_string();
        if !value.is_empty() {
            self.headers.add("Set-Cookie", value);
        }
    }

    /// Cap the request body at `limit` bytes. Once a handler reads past it
    /// the connection is closed after this response, and a response that
    /// has no status yet becomes `413 Payload Too Large`.
    pub fn limit_request_body(&mut self, request: &mut Request<'_>, limit: u64) {
        self.body_limit = Some(request.limit_body(limit));
    }

    /// Close the connection after this response
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    pub fn wants_close(&self) -> bool {
        self.close || self.limit_hit()
    }

    fn limit_hit(&self) -> bool {
        self.body_limit
            .as_ref()
            .is_some_and(|signal| signal.load(Ordering::Acquire))
    }

    /// Serialize the response to `sink`
    pub fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        if self.limit_hit() {
            self.close = true;
            if self.status.is_none() {
                self.status = Some(Status::PAYLOAD_TOO_LARGE);
                self.headers.set("Content-Type", "text/plain; charset=utf-8");
                self.body = b"request body too large\n".to_vec();
            }
        }
        let status = self.status.unwrap_or(Status::OK);

        if !self.headers.contains("Date") {
            self.headers
                .set("Date", Utc::now().format(TIME_FORMAT).to_string());
        }
        self.headers.remove("Transfer-Encoding");
        if status.allows_body() {
            self.headers
                .set("Content-Length", self.body.len().to_string());
        } else if status.code() != 304 {
            self.headers.remove("Content-Length");
        }
        if self.close {
            if !self.headers.has_token("Connection", "close") {
                self.headers.set("Connection", "close");
            }
        } else if !self.version.at_least(1, 1) {
            self.headers.set("Connection", "keep-alive");
        }

        let mut w = BufWriter::new(sink);
        write!(
            w,
            "{} {} {}{}",
            Version::HTTP_11,
            status.code(),
            status.reason_phrase(),
            CRLF
        )?;
        self.headers.write_to(&mut w, &[])?;
        w.write_all(CRLF.as_bytes())?;
        if status.allows_body() && self.method != Method::Head {
            w.write_all(&self.body)?;
        }
        w.flush()?;
        Ok(())
    }
}

impl Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let status = *self.status.get_or_insert(Status::OK);
        if !status.allows_body() {
            return Err(Error::BodyNotAllowed(status.code()).into_io());
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
