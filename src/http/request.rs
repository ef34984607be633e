//! HTTP requests
//!
//! A `Request` is parsed from a buffered connection with [`Request::read_from`]
//! or built with [`Request::builder`] and serialized with
//! [`Request::write_to`]. A parsed request borrows the connection reader for
//! its body, so the body must be drained before the next request on the same
//! connection can be read.

use super::body::{self, Body, BodyLength, Framing, MaxBytesReader};
use super::cookie::{self, Cookie};
use super::form::{parse_query, Values};
use super::multipart::{self, FileHeader, MultipartForm};
use super::parser::{parse_request_line, read_line};
use super::url::{parse_request_target, remove_zone, valid_host_header, Url};
use super::{
    Error, Headers, Method, Result, Version, CRLF, DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_MEMORY,
    DEFAULT_USER_AGENT, MAX_FORM_SIZE,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::warn;
use std::io::{BufRead, BufWriter, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Headers `write_to` emits itself or never forwards
const REQUEST_WRITE_EXCLUDE: &[&str] = &[
    "Host",
    "User-Agent",
    "Content-Length",
    "Transfer-Encoding",
    "Trailer",
];

/// HTTP request
#[derive(Debug)]
pub struct Request<'a> {
    method: Method,
    url: Url,
    version: Version,
    headers: Headers,
    host: String,
    body: Body<'a>,
    content_length: BodyLength,
    transfer_encoding: Vec<String>,
    close: bool,
    request_uri: String,
    remote_addr: Option<SocketAddr>,
    form: Option<Values>,
    post_form: Option<Values>,
    multipart_form: Option<MultipartForm>,
}

impl Request<'static> {
    /// Create a request for `url` without a body
    pub fn new(method: Method, url: &str) -> Result<Self> {
        Request::builder().method(method).uri(url).build()
    }
}

impl<'a> Request<'a> {
    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder<'a> {
        RequestBuilder::default()
    }

    /// Parse a request with the default header size limit
    pub fn parse(reader: &'a mut dyn BufRead) -> Result<Request<'a>> {
        Request::read_from(reader, DEFAULT_MAX_HEADER_BYTES)
    }

    /// Parse one request from `reader`.
    ///
    /// The request line and header block together may not exceed
    /// `max_header_bytes`. A clean EOF before the first byte is reported as
    /// `ConnectionClosed`.
    pub fn read_from(reader: &'a mut dyn BufRead, max_header_bytes: usize) -> Result<Request<'a>> {
        let mut budget = max_header_bytes;

        // Empty lines before the request line are ignored.
        let line = loop {
            match read_line(&mut *reader, &mut budget)? {
                None => return Err(Error::ConnectionClosed),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        let line = String::from_utf8(line)
            .map_err(|e| Error::MalformedRequestLine(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
        let (method, target, version) = parse_request_line(&line)?;
        let url = parse_request_target(&method, &target)?;

        let mut headers = Headers::read_from(&mut *reader, &mut budget)?;

        let mut hosts = headers.remove("Host");
        if hosts.len() > 1 {
            return Err(Error::InvalidHost(hosts.join(", ")));
        }
        let header_host = hosts.pop().unwrap_or_default();
        if !valid_host_header(&header_host) {
            return Err(Error::InvalidHost(header_host));
        }
        // An absolute-form target overrides the Host header.
        let host = if url.host.is_empty() {
            header_host
        } else {
            url.host.clone()
        };

        let (framing, content_length) = body::incoming_framing(&mut headers, version, None)?;
        let transfer_encoding = if framing == Framing::Chunked {
            vec!["chunked".to_string()]
        } else {
            Vec::new()
        };
        let close = body::should_close(version, &headers);

        Ok(Request {
            method,
            url,
            version,
            headers,
            host,
            body: Body::incoming(reader, framing),
            content_length,
            transfer_encoding,
            close,
            request_uri: target,
            remote_addr: None,
            form: None,
            post_form: None,
            multipart_form: None,
        })
    }

    /// Serialize the request, consuming its body.
    ///
    /// Content-Length or chunked framing is derived from
    /// [`Request::content_length`]. A body whose size differs from a known
    /// length fails with `ContentLengthMismatch`.
    pub fn write_to(&mut self, sink: &mut dyn Write) -> Result<()> {
        let mut w = BufWriter::new(sink);

        let mut host = if self.host.is_empty() {
            self.url.host.as_str()
        } else {
            self.host.as_str()
        };
        if !valid_host_header(host) {
            warn!("invalid Host {:?}; sending an empty Host header", host);
            host = "";
        }
        let host = remove_zone(host);

        let request_uri = if self.method == Method::Connect && self.url.path.is_empty() {
            host.clone()
        } else if self.url.path == "*" {
            "*".to_string()
        } else {
            self.url.request_uri()
        };

        write!(w, "{} {} {}{}", self.method, request_uri, self.version, CRLF)?;
        write!(w, "Host: {}{}", host, CRLF)?;

        match self.headers.get("User-Agent") {
            Some("") => {}
            Some(agent) => write!(w, "User-Agent: {}{}", agent.replace(['\r', '\n'], " "), CRLF)?,
            None => write!(w, "User-Agent: {}{}", DEFAULT_USER_AGENT, CRLF)?,
        }

        let framing = body::request_framing(&self.method, self.content_length, &self.body);
        body::write_framing_headers(&mut w, framing)?;
        if self.close && !self.headers.has_token("Connection", "close") {
            write!(w, "Connection: close{}", CRLF)?;
        }

        self.headers.write_to(&mut w, REQUEST_WRITE_EXCLUDE)?;
        w.write_all(CRLF.as_bytes())?;

        body::write_body(&mut w, &mut self.body, framing)?;
        w.flush()?;
        Ok(())
    }

    /// Get the request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the HTTP version
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

    /// Host the request is for: from an absolute-form target, else from the
    /// Host header. Empty when neither was present.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// The request-target exactly as it appeared on the request line
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    pub fn content_length(&self) -> BodyLength {
        self.content_length
    }

    pub fn set_content_length(&mut self, length: BodyLength) {
        self.content_length = length;
    }

    /// Transfer codings applied to the body, outermost last
    pub fn transfer_encoding(&self) -> &[String] {
        &self.transfer_encoding
    }

    /// Whether the connection should be closed after this exchange
    pub fn wants_close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    pub fn body(&self) -> &Body<'a> {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    /// Replace the body. The declared length follows the new body.
    pub fn set_body(&mut self, body: impl Into<Body<'a>>) {
        self.body = body.into();
        self.content_length = length_of(&self.body);
    }

    /// Cap the body at `limit` bytes. The returned flag is raised once a read
    /// went past the limit. An empty body is left as is.
    pub fn limit_body(&mut self, limit: u64) -> Arc<AtomicBool> {
        let signal = Arc::new(AtomicBool::new(false));
        if self.body.is_empty() {
            return signal;
        }
        let body = std::mem::take(&mut self.body);
        self.body = Body::from_reader(MaxBytesReader::with_signal(body, limit, signal.clone()));
        signal
    }

    pub fn proto_at_least(&self, major: u8, minor: u8) -> bool {
        self.version.at_least(major, minor)
    }

    /// Whether the client waits for `100 Continue` before sending the body
    pub fn expects_continue(&self) -> bool {
        self.version.at_least(1, 1) && self.headers.has_token("Expect", "100-continue")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("User-Agent")
    }

    /// Populate the form from the query and, for POST/PUT/PATCH with an
    /// `application/x-www-form-urlencoded` body, from the body. Body values
    /// come before query values of the same key. Later calls are no-ops.
    pub fn parse_form(&mut self) -> Result<()> {
        let mut first_err = None;
        if self.post_form.is_none() {
            let post = if self.method.has_form_body() {
                self.parse_post_form()
            } else {
                Ok(Values::new())
            };
            self.post_form = Some(post.unwrap_or_else(|e| {
                first_err = Some(e);
                Values::new()
            }));
        }
        if self.form.is_none() {
            let mut form = self.post_form.clone().unwrap_or_default();
            match parse_query(&self.url.raw_query) {
                Ok(query) => form.extend(query),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
            self.form = Some(form);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn parse_post_form(&mut self) -> Result<Values> {
        let content_type = self
            .headers
            .get("Content-Type")
            .unwrap_or("application/octet-stream");
        let media = multipart::parse_media_type(content_type)
            .map(|(media, _)| media)
            .ok_or_else(|| Error::Protocol(format!("invalid Content-Type {:?}", content_type)))?;
        if media != "application/x-www-form-urlencoded" {
            return Ok(Values::new());
        }
        let mut data = Vec::new();
        (&mut self.body).take(MAX_FORM_SIZE + 1).read_to_end(&mut data)?;
        if data.len() as u64 > MAX_FORM_SIZE {
            return Err(Error::BodyTooLarge);
        }
        parse_query(&String::from_utf8_lossy(&data))
    }

    /// Parse a multipart/form-data (or multipart/mixed) body. File parts
    /// beyond `max_memory` bytes are stored in temporary files.
    pub fn parse_multipart_form(&mut self, max_memory: u64) -> Result<()> {
        if self.form.is_none() {
            self.parse_form()?;
        }
        if self.multipart_form.is_some() {
            return Ok(());
        }
        let boundary = self
            .headers
            .get("Content-Type")
            .and_then(multipart::form_boundary)
            .ok_or(Error::NotMultipart)?;
        let form = multipart::read_form(&mut self.body, &boundary, max_memory)?;

        let target = self.form.get_or_insert_with(Values::new);
        target.extend(form.values.clone());
        let post = self.post_form.get_or_insert_with(Values::new);
        post.extend(form.values.clone());
        self.multipart_form = Some(form);
        Ok(())
    }

    /// Parsed form, once `parse_form` ran
    pub fn form(&self) -> Option<&Values> {
        self.form.as_ref()
    }

    pub fn post_form(&self) -> Option<&Values> {
        self.post_form.as_ref()
    }

    pub fn multipart_form(&self) -> Option<&MultipartForm> {
        self.multipart_form.as_ref()
    }

    /// First form value for `key`, parsing the form on first use. Parse
    /// errors are ignored.
    pub fn form_value(&mut self, key: &str) -> Option<&str> {
        if self.form.is_none() {
            let _ = self.parse_multipart_form(DEFAULT_MAX_MEMORY);
        }
        self.form.as_ref()?.get(key)
    }

    /// Like `form_value`, but ignores the query string
    pub fn post_form_value(&mut self, key: &str) -> Option<&str> {
        if self.post_form.is_none() {
            let _ = self.parse_multipart_form(DEFAULT_MAX_MEMORY);
        }
        self.post_form.as_ref()?.get(key)
    }

    /// First file uploaded under `key`
    pub fn form_file(&mut self, key: &str) -> Result<&FileHeader> {
        if self.multipart_form.is_none() {
            self.parse_multipart_form(DEFAULT_MAX_MEMORY)?;
        }
        self.multipart_form
            .as_ref()
            .and_then(|form| form.file(key))
            .ok_or_else(|| Error::Multipart(format!("no such file {:?}", key)))
    }

    /// Credentials of a `Basic` Authorization header
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let auth = self.headers.get("Authorization")?;
        let (scheme, encoded) = auth.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("Basic") {
            return None;
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }

    pub fn set_basic_auth(&mut self, user: &str, password: &str) {
        let token = BASE64.encode(format!("{}:{}", user, password));
        self.headers.set("Authorization", format!("Basic {}", token));
    }

    /// All cookies sent with the request
    pub fn cookies(&self) -> Vec<Cookie> {
        cookie::read_cookies(&self.headers, None)
    }

    /// The first cookie called `name`
    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        cookie::read_cookies(&self.headers, Some(name)).into_iter().next()
    }

    /// Append a cookie to the Cookie header. Only name and value are sent.
    pub fn add_cookie(&mut self, cookie: &Cookie) {
        let pair = cookie.request_pair();
        let value = match self.headers.get("Cookie") {
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, pair),
            _ => pair,
        };
        self.headers.set("Cookie", value);
    }
}

fn length_of(body: &Body<'_>) -> BodyLength {
    match body.known_len() {
        Some(0) => BodyLength::None,
        Some(n) => BodyLength::Known(n),
        None => BodyLength::Unknown,
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct RequestBuilder<'a> {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    host: Option<String>,
    body: Body<'a>,
    content_length: Option<BodyLength>,
    close: bool,
}

impl<'a> RequestBuilder<'a> {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Absolute URL or origin-form path
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Add a header
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Host header value, overriding the URL's host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the body; its length is used unless `content_length` overrides it
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

    /// Build the request
    pub fn build(self) -> Result<Request<'a>> {
        let uri = self.uri.unwrap_or_else(|| "/".to_string());
        let url = Url::parse(&uri)?;
        let host = self.host.unwrap_or_else(|| url.host.clone());
        let content_length = self.content_length.unwrap_or_else(|| length_of(&self.body));
        Ok(Request {
            method: self.method.unwrap_or_default(),
            url,
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            host,
            body: self.body,
            content_length,
            transfer_encoding: Vec::new(),
            close: self.close,
            request_uri: uri,
            remote_addr: None,
            form: None,
            post_form: None,
            multipart_form: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::multipart::MultipartWriter;

    fn parse(raw: &[u8]) -> Result<Vec<u8>> {
        let mut reader = raw;
        let mut req = Request::parse(&mut reader)?;
        req.body_mut().read_to_vec()
    }

    fn wire(req: &mut Request<'_>) -> String {
        let mut out = Vec::new();
        req.write_to(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_parse_simple_get() {
        let mut reader: &[u8] = b"GET / HTTP/1.1\r\nHost: foo.com\r\n\r\n";
        let mut req = Request::parse(&mut reader).unwrap();
        assert_eq!(*req.method(), Method::Get);
        assert_eq!(req.url().path, "/");
        assert_eq!(req.host(), "foo.com");
        assert_eq!(req.content_length(), BodyLength::None);
        assert!(!req.headers().contains("Host"));
        assert!(!req.wants_close());
        assert!(req.body_mut().read_to_vec().unwrap().is_empty());
    }

    #[test]
    fn test_parse_post_with_length() {
        let mut reader: &[u8] = b"POST / HTTP/1.1\r\nHost: foo.com\r\nContent-Length: 3\r\n\r\nabcGET";
        let mut req = Request::parse(&mut reader).unwrap();
        assert_eq!(req.content_length(), BodyLength::Known(3));
        assert_eq!(req.body_mut().read_to_vec().unwrap(), b"abc");
        drop(req);
        assert_eq!(reader, b"GET");
    }

    #[test]
    fn test_parse_chunked() {
        let raw = b"POST /upload HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 99\r\n\r\n\
                    3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut reader = &raw[..];
        let mut req = Request::parse(&mut reader).unwrap();
        assert_eq!(req.content_length(), BodyLength::Unknown);
        assert_eq!(req.transfer_encoding(), ["chunked"]);
        assert!(!req.headers().contains("Content-Length"));
        assert_eq!(req.body_mut().read_to_vec().unwrap(), b"abcde");
    }

    #[test]
    fn test_absolute_form_overrides_host() {
        let mut reader: &[u8] = b"GET http://real.com/x?y=1 HTTP/1.1\r\nHost: other.com\r\n\r\n";
        let req = Request::parse(&mut reader).unwrap();
        assert_eq!(req.host(), "real.com");
        assert_eq!(req.url().path, "/x");
        assert_eq!(req.request_uri(), "http://real.com/x?y=1");

        // Both forms resolve to the same host and path
        let mut reader: &[u8] = b"GET /x?y=1 HTTP/1.1\r\nHost: real.com\r\n\r\n";
        let origin = Request::parse(&mut reader).unwrap();
        assert_eq!(origin.host(), req.host());
        assert_eq!(origin.url().request_uri(), req.url().request_uri());
    }

    #[test]
    fn test_parse_errors() {
        let cases: [(&[u8], fn(&Error) -> bool); 6] = [
            (b"GET /\r\n\r\n", |e| matches!(e, Error::MalformedRequestLine(_))),
            (b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n", |e| matches!(e, Error::InvalidHost(_))),
            (b"GET / HTTP/1.1\r\nHost: a b\r\n\r\n", |e| matches!(e, Error::InvalidHost(_))),
            (b"GET / HTTP/1.1\r\nBad Header\r\n\r\n", |e| matches!(e, Error::InvalidHeader(_))),
            (b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n", |e| matches!(e, Error::InvalidContentLength(_))),
            (b"GET / HTTP/1.1\r\nHost: a\r\n", |e| matches!(e, Error::UnexpectedEof)),
        ];
        for (raw, check) in cases {
            let err = parse(raw).unwrap_err();
            assert!(check(&err), "{:?} -> {:?}", String::from_utf8_lossy(raw), err);
        }
        assert!(matches!(parse(b"").unwrap_err(), Error::ConnectionClosed));
    }

    #[test]
    fn test_header_limit() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(format!("X-Big: {}\r\n\r\n", "a".repeat(200)).as_bytes());
        let mut reader = &raw[..];
        let err = Request::read_from(&mut reader, 64).unwrap_err();
        assert!(matches!(err, Error::HeaderTooLarge));
    }

    #[test]
    fn test_close_semantics() {
        let mut reader: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
        assert!(Request::parse(&mut reader).unwrap().wants_close());

        let mut reader: &[u8] = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        assert!(!Request::parse(&mut reader).unwrap().wants_close());

        let mut reader: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
        assert!(Request::parse(&mut reader).unwrap().wants_close());
    }

    #[test]
    fn test_write_get() {
        let mut req = Request::new(Method::Get, "http://www.example.com/search?q=rust").unwrap();
        req.headers_mut().set("Accept", "*/*");
        assert_eq!(
            wire(&mut req),
            format!(
                "GET /search?q=rust HTTP/1.1\r\nHost: www.example.com\r\nUser-Agent: {}\r\nAccept: */*\r\n\r\n",
                DEFAULT_USER_AGENT
            )
        );
    }

    #[test]
    fn test_write_post_known_length() {
        let mut req = Request::builder()
            .method(Method::Post)
            .uri("http://example.com/")
            .header("User-Agent", "")
            .header("Content-Length", "999")
            .body("abc")
            .build()
            .unwrap();
        assert_eq!(
            wire(&mut req),
            "POST / HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc"
        );
    }

    #[test]
    fn test_write_empty_post_sends_zero_length() {
        let mut req = Request::builder()
            .method(Method::Post)
            .uri("http://example.com/")
            .header("User-Agent", "test")
            .close(true)
            .build()
            .unwrap();
        assert_eq!(
            wire(&mut req),
            "POST / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_write_unknown_length_is_chunked() {
        let mut req = Request::builder()
            .method(Method::Put)
            .uri("http://example.com/f")
            .header("User-Agent", "")
            .body(Body::from_reader(&b"abcdef"[..]))
            .build()
            .unwrap();
        assert_eq!(
            wire(&mut req),
            "PUT /f HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nabcdef\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn test_write_length_mismatch_fails() {
        let mut req = Request::builder()
            .method(Method::Post)
            .uri("http://example.com/")
            .body("abc")
            .content_length(BodyLength::Known(10))
            .build()
            .unwrap();
        let mut out = Vec::new();
        let err = req.write_to(&mut out).unwrap_err();
        assert!(matches!(err, Error::ContentLengthMismatch { declared: 10, actual: 3 }));
    }

    #[test]
    fn test_write_host_handling() {
        let mut req = Request::new(Method::Get, "http://[fe80::1%25en0]:8080/").unwrap();
        req.headers_mut().set("User-Agent", "");
        assert_eq!(wire(&mut req), "GET / HTTP/1.1\r\nHost: [fe80::1]:8080\r\n\r\n");

        let mut req = Request::new(Method::Get, "http://example.com/").unwrap();
        req.headers_mut().set("User-Agent", "");
        req.set_host("evil.com\r\nX-Injected: 1");
        assert_eq!(wire(&mut req), "GET / HTTP/1.1\r\nHost: \r\n\r\n");

        let mut req = Request::new(Method::Connect, "http://proxy.example:443").unwrap();
        req.headers_mut().set("User-Agent", "");
        assert_eq!(wire(&mut req), "CONNECT proxy.example:443 HTTP/1.1\r\nHost: proxy.example:443\r\n\r\n");
    }

    #[test]
    fn test_round_trip() {
        let mut req = Request::builder()
            .method(Method::Patch)
            .uri("http://api.example.com/items/7?verbose=1")
            .header("X-Trace", "abc")
            .header("x-trace", "def")
            .header("Content-Type", "application/json")
            .body(r#"{"name":"x"}"#)
            .build()
            .unwrap();
        let mut wire_bytes = Vec::new();
        req.write_to(&mut wire_bytes).unwrap();

        let mut reader = &wire_bytes[..];
        let mut parsed = Request::parse(&mut reader).unwrap();
        assert_eq!(*parsed.method(), Method::Patch);
        assert_eq!(parsed.host(), "api.example.com");
        assert_eq!(parsed.url().request_uri(), "/items/7?verbose=1");
        assert_eq!(parsed.headers().values("X-Trace"), ["abc", "def"]);
        assert_eq!(parsed.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(parsed.body_mut().read_to_vec().unwrap(), br#"{"name":"x"}"#);
    }

    #[test]
    fn test_parse_form_merges_body_first() {
        let raw = b"POST /submit?q=query&only=url HTTP/1.1\r\nHost: a\r\n\
                    Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 18\r\n\r\n\
                    q=body&name=a+b%21";
        let mut reader = &raw[..];
        let mut req = Request::parse(&mut reader).unwrap();
        req.parse_form().unwrap();
        assert_eq!(req.form().unwrap().get_all("q"), ["body", "query"]);
        assert_eq!(req.post_form().unwrap().get_all("q"), ["body"]);
        assert_eq!(req.form_value("name"), Some("a b!"));
        assert_eq!(req.post_form_value("only"), None);
        assert_eq!(req.form_value("only"), Some("url"));

        // Idempotent
        req.parse_form().unwrap();
        assert_eq!(req.form().unwrap().get_all("q").len(), 2);
    }

    #[test]
    fn test_parse_form_ignores_body_for_get() {
        let raw = b"GET /?a=1 HTTP/1.1\r\nHost: a\r\nContent-Type: application/x-www-form-urlencoded\r\n\
                    Content-Length: 3\r\n\r\nb=2";
        let mut reader = &raw[..];
        let mut req = Request::parse(&mut reader).unwrap();
        req.parse_form().unwrap();
        assert_eq!(req.form().unwrap().get("a"), Some("1"));
        assert_eq!(req.form().unwrap().get("b"), None);
    }

    #[test]
    fn test_parse_multipart_form() {
        let mut writer = MultipartWriter::with_boundary(Vec::new(), "frontier");
        writer.write_field("title", "report").unwrap();
        writer.write_file("doc", "/home/user/report.txt", b"contents").unwrap();
        let body = writer.finish().unwrap();

        let mut raw = format!(
            "POST /up?src=cli HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data; boundary=frontier\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let mut reader = &raw[..];
        let mut req = Request::parse(&mut reader).unwrap();
        assert_eq!(req.form_value("title"), Some("report"));
        assert_eq!(req.form_value("src"), Some("cli"));
        let file = req.form_file("doc").unwrap();
        assert_eq!(file.filename, "report.txt");
        assert_eq!(file.size, 8);
        assert!(req.form_file("nope").is_err());
    }

    #[test]
    fn test_not_multipart() {
        let mut reader: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Type: text/plain\r\n\r\n";
        let mut req = Request::parse(&mut reader).unwrap();
        assert!(matches!(req.parse_multipart_form(1024), Err(Error::NotMultipart)));

        let mut reader: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data\r\n\r\n";
        let mut req = Request::parse(&mut reader).unwrap();
        assert!(matches!(req.parse_multipart_form(1024), Err(Error::NotMultipart)));
    }

    #[test]
    fn test_basic_auth() {
        let mut req = Request::new(Method::Get, "http://example.com/").unwrap();
        assert_eq!(req.basic_auth(), None);
        req.set_basic_auth("Aladdin", "open sesame");
        assert_eq!(req.headers().get("Authorization"), Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="));
        assert_eq!(
            req.basic_auth(),
            Some(("Aladdin".to_string(), "open sesame".to_string()))
        );
    }

    #[test]
    fn test_cookies() {
        let mut req = Request::new(Method::Get, "http://example.com/").unwrap();
        req.add_cookie(&Cookie::new("session", "abc"));
        req.add_cookie(&Cookie::new("theme", "dark mode"));
        assert_eq!(req.headers().get("Cookie"), Some("session=abc; theme=\"dark mode\""));

        assert_eq!(req.cookies().len(), 2);
        assert_eq!(req.cookie("theme").unwrap().value, "dark mode");
        assert!(req.cookie("missing").is_none());
    }

    #[test]
    fn test_limit_body() {
        let mut reader: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut req = Request::parse(&mut reader).unwrap();
        let signal = req.limit_body(4);
        let err = req.body_mut().read_to_vec().unwrap_err();
        assert!(matches!(err, Error::BodyTooLarge));
        assert!(signal.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn test_limit_body_keeps_empty_body() {
        let mut reader: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut req = Request::parse(&mut reader).unwrap();
        let signal = req.limit_body(4);
        assert!(req.body().is_empty());
        assert_eq!(req.body_mut().read_to_vec().unwrap(), b"");
        assert!(!signal.load(std::sync::atomic::Ordering::Acquire));
    }
}
