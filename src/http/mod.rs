//! HTTP/1.1 message engine
//!
//! This module parses HTTP/1.x requests and responses from a byte stream and
//! serializes them back to the wire. It covers body framing (Content-Length,
//! chunked transfer-coding, close-delimited), header canonicalization, the
//! Cookie/Set-Cookie grammar, url-encoded and multipart forms, and a small
//! threaded server with a pattern router.
//!
//! # Architecture
//!
//! The I/O layer uses a session operations abstraction so the codecs never
//! touch sockets directly:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `HttpSession` adds read/write deadlines and implements `io::Read`/`io::Write`
//! - Requests and responses are parsed from any `BufRead` and written to any `Write`
//!
//! # Examples
//!
//! ```no_run
//! use httpwire::http::{HttpClient, Request, Method};
//! use httpwire::http::session::FdSessionOps;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let mut client = HttpClient::new(FdSessionOps::new(stream)).unwrap();
//!
//! let mut request = Request::builder()
//!     .method(Method::Get)
//!     .uri("http://localhost/")
//!     .build()
//!     .unwrap();
//! let response = client.round_trip(&mut request).unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod body;
pub mod chunked;
pub mod client;
pub mod cookie;
pub mod form;
pub mod headers;
pub mod message;
pub mod multipart;
pub mod parser;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod url;

pub use body::{Body, BodyLength, MaxBytesReader};
pub use client::HttpClient;
pub use cookie::{Cookie, SameSite};
pub use form::Values;
pub use headers::Headers;
pub use message::{Method, Status, Version};
pub use multipart::{FileHeader, MultipartForm};
pub use request::{Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, ResponseWriter};
pub use router::{default_router, Router};
pub use server::{handler_fn, Handler, HandlerFunc, HttpServer, ServerConfig, ServerConn};
pub use session::{HttpSession, SessionOps};
pub use url::Url;

use std::io;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("malformed header line: {0}")]
    InvalidHeader(String),

    #[error("invalid HTTP version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid HTTP method: {0:?}")]
    InvalidMethod(String),

    #[error("invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid Host header: {0:?}")]
    InvalidHost(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),

    #[error("unsupported transfer encoding: {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("Content-Length mismatch: declared {declared}, body has {actual}")]
    ContentLengthMismatch { declared: u64, actual: u64 },

    #[error("request body too large")]
    BodyTooLarge,

    #[error("header block too large")]
    HeaderTooLarge,

    #[error("body not allowed for status {0}")]
    BodyNotAllowed(u16),

    #[error("invalid cookie: {0}")]
    InvalidCookie(String),

    #[error("request Content-Type isn't multipart/form-data")]
    NotMultipart,

    #[error("multipart: {0}")]
    Multipart(String),

    #[error("invalid route pattern: {0:?}")]
    InvalidPattern(String),

    #[error("multiple registrations for {0:?}")]
    DuplicatePattern(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Coarse classification used by the connection handler to decide how a
/// failure affects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A start line or header line does not match the grammar.
    MalformedLine,
    /// Framing violation: bad chunk size, premature EOF, length mismatch.
    Protocol,
    /// A configured size cap was exceeded.
    LimitExceeded,
    /// A value was rejected (Host bytes, cookie attributes, patterns).
    Validation,
    /// A read or write deadline expired.
    Timeout,
    /// Transport failure.
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRequestLine(_)
            | Error::MalformedStatusLine(_)
            | Error::InvalidHeader(_)
            | Error::InvalidVersion(_)
            | Error::InvalidMethod(_)
            | Error::InvalidStatus(_) => ErrorKind::MalformedLine,
            Error::InvalidContentLength(_)
            | Error::InvalidChunkSize(_)
            | Error::UnsupportedTransferEncoding(_)
            | Error::UnexpectedEof
            | Error::ContentLengthMismatch { .. }
            | Error::BodyNotAllowed(_)
            | Error::Multipart(_)
            | Error::NotMultipart
            | Error::Protocol(_) => ErrorKind::Protocol,
            Error::BodyTooLarge | Error::HeaderTooLarge => ErrorKind::LimitExceeded,
            Error::InvalidUrl(_)
            | Error::InvalidHost(_)
            | Error::InvalidCookie(_)
            | Error::InvalidPattern(_)
            | Error::DuplicatePattern(_) => ErrorKind::Validation,
            Error::Timeout => ErrorKind::Timeout,
            Error::Io(_) | Error::ConnectionClosed => ErrorKind::Io,
        }
    }

    /// Wrap this error so it can travel through `io::Read`/`io::Write`.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            Error::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, Error::UnexpectedEof),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, Error::Timeout),
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            let kind = err.kind();
            if let Some(inner) = err.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }
            return Error::Io(io::Error::from(kind));
        }
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::Io(err),
        }
    }
}

/// Maximum size of a request or response header block
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Default memory budget for `Request::parse_multipart_form`
pub const DEFAULT_MAX_MEMORY: u64 = 32 << 20;

/// Upper bound on an application/x-www-form-urlencoded body
pub const MAX_FORM_SIZE: u64 = 10 << 20;

/// How much of an unread request body the server discards before giving up
/// on the connection.
pub const MAX_DRAIN_BYTES: u64 = 256 << 10;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// User-Agent sent when the request does not carry one
pub const DEFAULT_USER_AGENT: &str = concat!("httpwire/", env!("CARGO_PKG_VERSION"));

/// Date layout used by Date, Expires and Set-Cookie (RFC 1123, always GMT)
pub const TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// CRLF line ending
pub const CRLF: &str = "\r\n";
