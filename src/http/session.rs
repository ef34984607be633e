//! Session operations abstraction
//!
//! This module provides the session operations pattern that keeps the HTTP
//! codecs independent of the transport. A `SessionOps` implementation moves
//! bytes; `HttpSession` layers read and write deadlines on top and exposes
//! the result as `io::Read`/`io::Write`.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Session operations trait
///
/// This trait defines the operations that can be performed on a
/// connection-oriented byte stream.
pub trait SessionOps: Send {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the session in both directions.
    ///
    /// Any read blocked on another handle of the same connection returns.
    fn close(&mut self) -> Result<()>;

    /// Another handle to the same connection, so reading and writing can be
    /// owned separately.
    fn try_clone(&self) -> Result<Self>
    where
        Self: Sized;

    /// Address of the remote peer
    fn peer_addr(&self) -> Result<SocketAddr>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// HTTP session wrapping a transport with session operations
pub struct HttpSession<S: SessionOps> {
    session: S,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Create a new HTTP session without deadlines
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Set both the read and the write deadline
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.write_deadline = deadline;
    }

    /// Reads not completed by `deadline` fail with `Timeout`
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    /// Writes not completed by `deadline` fail with `Timeout`
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline
    }

    /// A second session over the same connection, without deadlines
    pub fn try_clone(&self) -> Result<Self> {
        Ok(HttpSession::new(self.session.try_clone()?))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.session.peer_addr()
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Get a reference to the underlying session
    pub fn get_ref(&self) -> &S {
        &self.session
    }

    /// Get a mutable reference to the underlying session
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    fn wait(&self, events: PollEvents, deadline: Option<Instant>) -> Result<()> {
        let Some(deadline) = deadline else {
            return Ok(());
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        if !self.session.poll(events, Some(deadline - now))? {
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

impl<S: SessionOps> Read for HttpSession<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait(PollEvents::Read, self.read_deadline)
            .map_err(Error::into_io)?;
        self.session.read(buf).map_err(Error::into_io)
    }
}

impl<S: SessionOps> Write for HttpSession<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wait(PollEvents::Write, self.write_deadline)
            .map_err(Error::into_io)?;
        self.session.write(buf).map_err(Error::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        use libc::{poll, pollfd, POLLIN, POLLOUT};

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events: match events {
                PollEvents::Read => POLLIN,
                PollEvents::Write => POLLOUT,
                PollEvents::Both => POLLIN | POLLOUT,
            },
            revents: 0,
        };

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1); // -1 = infinite

        loop {
            let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
            if result >= 0 {
                return Ok(result > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Io(err));
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(FdSessionOps::new(self.stream.try_clone()?))
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Helper to create an HTTP session from a TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<FdSessionOps> {
    HttpSession::new(FdSessionOps::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_fd_session_ops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Hello").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = FdSessionOps::new(stream);
        assert_eq!(session.peer_addr().unwrap(), addr);

        // Poll for read
        assert!(session.poll(PollEvents::Read, Some(Duration::from_secs(1))).unwrap());

        // Read data
        let mut buf = [0u8; 5];
        let n = SessionOps::read(&mut session, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_http_session_read_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Don't send anything - test timeout
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = from_tcp_stream(stream);
        session.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));

        let mut buf = [0u8; 10];
        let err = session.read(&mut buf).unwrap_err();
        assert!(matches!(Error::from(err), Error::Timeout));
    }

    #[test]
    fn test_expired_deadline_fails_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut session = from_tcp_stream(stream);
        session.set_deadline(Some(Instant::now()));

        let err = session.write(b"x").unwrap_err();
        assert!(matches!(Error::from(err), Error::Timeout));
    }

    #[test]
    fn test_close_unblocks_clone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = from_tcp_stream(stream);
        let mut reader = writer.try_clone().unwrap();

        let blocked = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        writer.close().unwrap();

        assert_eq!(blocked.join().unwrap().unwrap(), 0);
    }
}
