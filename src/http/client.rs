//! HTTP client implementation
//!
//! A single-connection client: requests are written and responses read in
//! order over one session. A response borrows the client, so its body must
//! be consumed or dropped before the next request is sent.

use super::request::Request;
use super::response::Response;
use super::{Body, HttpSession, Method, Result, SessionOps};
use std::io::{BufRead, BufReader};
use std::time::{Duration, Instant};

/// HTTP client
///
/// Provides methods for sending requests and receiving responses.
pub struct HttpClient<S: SessionOps> {
    reader: BufReader<HttpSession<S>>,
    writer: HttpSession<S>,
}

impl<S: SessionOps> HttpClient<S> {
    /// Create a new HTTP client with a session
    pub fn new(session: S) -> Result<Self> {
        let writer = HttpSession::new(session.try_clone()?);
        Ok(HttpClient {
            reader: BufReader::new(HttpSession::new(session)),
            writer,
        })
    }

    /// Fail reads and writes that take longer than `timeout` from now
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.reader.get_mut().set_read_deadline(deadline);
        self.writer.set_write_deadline(deadline);
    }

    /// Send an HTTP request.
    ///
    /// A request without any host is addressed to the peer.
    pub fn send_request(&mut self, request: &mut Request<'_>) -> Result<()> {
        if request.host().is_empty() {
            if let Ok(addr) = self.writer.peer_addr() {
                request.set_host(addr.to_string());
            }
        }
        request.write_to(&mut self.writer)
    }

    /// Receive the response to a request made with `method`, skipping
    /// interim `1xx` responses.
    pub fn receive_response(&mut self, method: &Method) -> Result<Response<'_>> {
        let reader: &mut dyn BufRead = &mut self.reader;
        Response::read_final(reader, method)
    }

    /// Send `request` and receive its response
    pub fn round_trip(&mut self, request: &mut Request<'_>) -> Result<Response<'_>> {
        let method = request.method().clone();
        self.send_request(request)?;
        self.receive_response(&method)
    }

    /// Send a simple GET request
    pub fn get(&mut self, url: &str) -> Result<Response<'_>> {
        let mut request = Request::new(Method::Get, url)?;
        self.round_trip(&mut request)
    }

    /// Send a simple POST request with body
    pub fn post(&mut self, url: &str, content_type: &str, body: impl Into<Body<'static>>) -> Result<Response<'_>> {
        let mut request = Request::builder()
            .method(Method::Post)
            .uri(url)
            .header("Content-Type", content_type)
            .body(body)
            .build()?;
        self.round_trip(&mut request)
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        self.writer.close()
    }

    /// Get a reference to the underlying session
    pub fn session(&self) -> &HttpSession<S> {
        &self.writer
    }

    /// Get a mutable reference to the underlying session
    pub fn session_mut(&mut self) -> &mut HttpSession<S> {
        &mut self.writer
    }
}
