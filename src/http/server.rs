//! HTTP server implementation
//!
//! [`ServerConn`] runs the request/response loop of one connection.
//! [`HttpServer`] owns a listening socket and serves every accepted
//! connection on its own thread.

use super::request::Request;
use super::response::ResponseWriter;
use super::session::{FdSessionOps, HttpSession, SessionOps};
use super::{Error, Result, Status, CRLF, DEFAULT_MAX_HEADER_BYTES, MAX_DRAIN_BYTES};
use log::{debug, error, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Responds to one HTTP request
pub trait Handler: Send + Sync {
    fn serve_http(&self, w: &mut ResponseWriter, req: &mut Request<'_>);
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve_http(&self, w: &mut ResponseWriter, req: &mut Request<'_>) {
        (**self).serve_http(w, req)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn serve_http(&self, w: &mut ResponseWriter, req: &mut Request<'_>) {
        (**self).serve_http(w, req)
    }
}

/// Adapter that lets a closure act as a [`Handler`]
pub struct HandlerFunc<F>(F);

impl<F> Handler for HandlerFunc<F>
where
    F: Fn(&mut ResponseWriter, &mut Request<'_>) + Send + Sync,
{
    fn serve_http(&self, w: &mut ResponseWriter, req: &mut Request<'_>) {
        (self.0)(w, req)
    }
}

/// Wrap a closure as a handler
pub fn handler_fn<F>(f: F) -> HandlerFunc<F>
where
    F: Fn(&mut ResponseWriter, &mut Request<'_>) + Send + Sync,
{
    HandlerFunc(f)
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Time allowed to read a whole request, body included
    pub read_timeout: Option<Duration>,
    /// Time allowed to write a response
    pub write_timeout: Option<Duration>,
    /// Time a kept-alive connection may wait for its next request.
    /// Falls back to `read_timeout`.
    pub idle_timeout: Option<Duration>,
    /// Cap on request line plus header block
    pub max_header_bytes: usize,
    /// Cap on every request body, enforced before the handler runs
    pub max_body_bytes: Option<u64>,
    /// Listen backlog
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: None,
            backlog: 128,
        }
    }
}

/// One server-side connection.
///
/// Requests are handled strictly in order: a request's body is drained
/// before the next request line is read.
pub struct ServerConn<S: SessionOps> {
    reader: BufReader<HttpSession<S>>,
    writer: HttpSession<S>,
    config: ServerConfig,
    remote_addr: Option<SocketAddr>,
    served: u64,
}

impl<S: SessionOps> ServerConn<S> {
    /// Wrap a session; a second handle is cloned for writing.
    pub fn new(session: S, config: ServerConfig) -> Result<Self> {
        let remote_addr = session.peer_addr().ok();
        let writer = HttpSession::new(session.try_clone()?);
        Ok(ServerConn {
            reader: BufReader::new(HttpSession::new(session)),
            writer,
            config,
            remote_addr,
            served: 0,
        })
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Number of responses written so far
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serve requests until the connection should close.
    ///
    /// A peer closing between requests ends the loop with `Ok`.
    pub fn serve(&mut self, handler: &dyn Handler) -> Result<()> {
        while self.serve_one(handler)? {}
        let _ = self.writer.close();
        Ok(())
    }

    /// Handle one exchange. Returns whether the connection can be reused.
    fn serve_one(&mut self, handler: &dyn Handler) -> Result<bool> {
        if self.served > 0 {
            let idle = self.config.idle_timeout.or(self.config.read_timeout);
            self.reader
                .get_mut()
                .set_read_deadline(idle.map(|d| Instant::now() + d));
            match self.reader.fill_buf() {
                Ok([]) => return Ok(false),
                Ok(_) => {}
                Err(e) => {
                    debug!("{:?}: idle connection ended: {}", self.remote_addr, e);
                    return Ok(false);
                }
            }
        }
        let now = Instant::now();
        self.reader
            .get_mut()
            .set_read_deadline(self.config.read_timeout.map(|d| now + d));
        self.writer
            .set_write_deadline(self.config.write_timeout.map(|d| now + d));

        let reader: &mut dyn BufRead = &mut self.reader;
        let mut req = match Request::read_from(reader, self.config.max_header_bytes) {
            Ok(req) => req,
            Err(Error::ConnectionClosed) => return Ok(false),
            Err(e) => {
                if let Some((status, detail)) = error_reply(&e) {
                    debug!("{:?}: bad request: {}", self.remote_addr, e);
                    // Best effort: the peer may already be gone.
                    let _ = write_error(&mut self.writer, status, detail);
                    return Ok(false);
                }
                return Err(e);
            }
        };

        if req.version().major() != 1 {
            write_error(
                &mut self.writer,
                Status::HTTP_VERSION_NOT_SUPPORTED,
                "unsupported protocol version",
            )?;
            return Ok(false);
        }
        if req.version().at_least(1, 1) && req.host().is_empty() {
            write_error(&mut self.writer, Status::BAD_REQUEST, "missing required Host header")?;
            return Ok(false);
        }
        req.set_remote_addr(self.remote_addr);

        let send_continue = req.expects_continue() && !req.body().is_empty();
        let mut w = ResponseWriter::for_request(&req);
        if let Some(limit) = self.config.max_body_bytes {
            w.limit_request_body(&mut req, limit);
        }
        if send_continue {
            write!(self.writer, "HTTP/1.1 100 Continue{}{}", CRLF, CRLF)?;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.serve_http(&mut w, &mut req)));
        if outcome.is_err() {
            error!("{:?}: panic serving {}", self.remote_addr, req.url());
            return Ok(false);
        }

        // The next request can only be read once this body is consumed.
        if !w.wants_close() {
            match req.body_mut().drain(MAX_DRAIN_BYTES) {
                Ok(true) => {}
                Ok(false) => w.set_close(true),
                Err(e) => {
                    debug!("{:?}: discarding request body: {}", self.remote_addr, e);
                    w.set_close(true);
                }
            }
        }

        w.finish(&mut self.writer)?;
        self.served += 1;
        Ok(!w.wants_close())
    }
}

/// Status and message sent for a request that failed to parse, or `None`
/// when nothing should be written.
fn error_reply(err: &Error) -> Option<(Status, &'static str)> {
    match err {
        Error::Timeout | Error::Io(_) | Error::UnexpectedEof | Error::ConnectionClosed => None,
        Error::HeaderTooLarge => Some((Status::REQUEST_HEADER_FIELDS_TOO_LARGE, "")),
        Error::UnsupportedTransferEncoding(_) => {
            Some((Status::NOT_IMPLEMENTED, "unsupported transfer encoding"))
        }
        Error::InvalidHost(_) => Some((Status::BAD_REQUEST, "invalid Host header")),
        _ => Some((Status::BAD_REQUEST, "")),
    }
}

fn write_error(sink: &mut dyn Write, status: Status, detail: &str) -> io::Result<()> {
    let mut body = format!("{} {}", status.code(), status.reason_phrase());
    if !detail.is_empty() {
        body.push_str(": ");
        body.push_str(detail);
    }
    write!(
        sink,
        "HTTP/1.1 {} {}{crlf}Content-Type: text/plain; charset=utf-8{crlf}Connection: close{crlf}\
         Content-Length: {}{crlf}{crlf}{}",
        status.code(),
        status.reason_phrase(),
        body.len(),
        body,
        crlf = CRLF
    )?;
    sink.flush()
}

/// Threaded HTTP/1.x server
pub struct HttpServer {
    listener: TcpListener,
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
}

impl HttpServer {
    /// Listen on `addr` with address reuse enabled
    pub fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;
        debug!("listening on {}", addr);

        Ok(HttpServer {
            listener: socket.into(),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until [`HttpServer::shutdown`] is called, serving
    /// each on its own thread.
    pub fn serve(&self, handler: Arc<dyn Handler>) -> Result<()> {
        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("accept failed: {}", e);
                    thread::sleep(Duration::from_millis(5));
                    continue;
                }
            };
            let handler = handler.clone();
            let config = self.config.clone();
            thread::spawn(move || serve_stream(stream, config, &*handler));
        }
        debug!("server stopped");
        Ok(())
    }

    /// Stop accepting connections. Connections already being served run
    /// to completion.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the accept loop.
        if let Ok(addr) = self.listener.local_addr() {
            let _ = TcpStream::connect(addr);
        }
    }
}

fn serve_stream(stream: TcpStream, config: ServerConfig, handler: &dyn Handler) {
    let mut conn = match ServerConn::new(FdSessionOps::new(stream), config) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("cannot set up connection: {}", e);
            return;
        }
    };
    debug!("{:?}: connection opened", conn.remote_addr());
    match conn.serve(handler) {
        Ok(()) => debug!("{:?}: connection closed after {} responses", conn.remote_addr(), conn.served()),
        Err(e) => debug!("{:?}: connection failed: {}", conn.remote_addr(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::Shutdown;

    /// Serve one connection with `handler`, feeding it `raw` and returning
    /// everything the server wrote.
    fn exchange<H: Handler + 'static>(handler: H, config: ServerConfig, raw: &[u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = ServerConn::new(FdSessionOps::new(stream), config).unwrap();
            let _ = conn.serve(&handler);
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        handle.join().unwrap();
        out
    }

    fn echo_path() -> impl Handler {
        handler_fn(|w, req| {
            let body = req.body_mut().read_to_vec().unwrap_or_default();
            write!(w, "{} {} {}", req.method(), req.url().path, body.len()).unwrap();
        })
    }

    #[test]
    fn test_keep_alive_pipeline() {
        let out = exchange(
            echo_path(),
            ServerConfig::default(),
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nPOST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc",
        );
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        let first = out.find("GET /a 0").unwrap();
        let second = out.find("POST /b 3").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_connection_close_honored() {
        let out = exchange(
            echo_path(),
            ServerConfig::default(),
            b"GET /a HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(out.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_error_replies() {
        let cases: [(&[u8], &str); 4] = [
            (b"GARBAGE\r\n\r\n", "HTTP/1.1 400 Bad Request"),
            (b"GET / HTTP/1.1\r\n\r\n", "HTTP/1.1 400 Bad Request"),
            (b"GET / HTTP/2.0\r\nHost: x\r\n\r\n", "HTTP/1.1 505 HTTP Version Not Supported"),
            (
                b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n",
                "HTTP/1.1 501 Not Implemented",
            ),
        ];
        for (raw, expected) in cases {
            let out = exchange(echo_path(), ServerConfig::default(), raw);
            assert!(out.starts_with(expected), "{:?}", out);
            assert!(out.contains("Connection: close\r\n"));
        }
    }

    #[test]
    fn test_header_too_large() {
        let config = ServerConfig {
            max_header_bytes: 64,
            ..ServerConfig::default()
        };
        let raw = format!("GET / HTTP/1.1\r\nHost: x\r\nX-Big: {}\r\n\r\n", "a".repeat(100));
        let out = exchange(echo_path(), config, raw.as_bytes());
        assert!(out.starts_with("HTTP/1.1 431 Request Header Fields Too Large"));
    }

    #[test]
    fn test_expect_continue() {
        let out = exchange(
            echo_path(),
            ServerConfig::default(),
            b"PUT /f HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\nok",
        );
        assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("PUT /f 2"));
    }

    #[test]
    fn test_expect_continue_without_body() {
        let config = ServerConfig {
            max_body_bytes: Some(100),
            ..ServerConfig::default()
        };
        let out = exchange(
            echo_path(),
            config,
            b"GET /g HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n\r\n",
        );
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!out.contains("100 Continue"));
        assert!(out.ends_with("GET /g 0"));
    }

    #[test]
    fn test_expect_continue_with_body_limit() {
        let config = ServerConfig {
            max_body_bytes: Some(100),
            ..ServerConfig::default()
        };
        let out = exchange(
            echo_path(),
            config,
            b"PUT /f HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\nok",
        );
        assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("PUT /f 2"));
    }

    #[test]
    fn test_body_limit_replies_413() {
        let config = ServerConfig {
            max_body_bytes: Some(4),
            ..ServerConfig::default()
        };
        let handler = handler_fn(|_w, req| {
            let _ = req.body_mut().read_to_vec();
        });
        let out = exchange(
            handler,
            config,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n0123456789GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert_eq!(out.matches("HTTP/1.1").count(), 1);
    }

    #[test]
    fn test_unread_body_is_drained() {
        let handler = handler_fn(|w, _req| {
            w.write_all(b"ignored body").unwrap();
        });
        let out = exchange(
            handler,
            ServerConfig::default(),
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[test]
    fn test_handler_panic_closes_connection() {
        let handler = handler_fn(|_w, _req| panic!("boom"));
        let out = exchange(handler, ServerConfig::default(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(out.is_empty());
    }

    #[test]
    fn test_http_server_serves_and_shuts_down() {
        let server = Arc::new(HttpServer::bind("127.0.0.1:0", ServerConfig::default()).unwrap());
        let addr = server.local_addr().unwrap();
        let runner = {
            let server = server.clone();
            thread::spawn(move || server.serve(Arc::new(echo_path())))
        };

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("GET /hello 0"));

        server.shutdown();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_read_timeout_ends_connection() {
        let config = ServerConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..ServerConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = ServerConn::new(FdSessionOps::new(stream), config).unwrap();
            conn.serve(&echo_path())
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Timeout)));
        drop(stream);
    }
}
