//! Readiness-polled TCP endpoints.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each endpoint owns its descriptor exclusively and carries its own
//! `mio::Poll`, so a bounded readiness check never blocks longer than
//! the caller's timeout. mio delivers edge-triggered events, so callers
//! must drain a ready socket (read/accept until `NotReady`) before
//! polling again.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::trace;

const ENDPOINT_TOKEN: Token = Token(0);

/// How long `send` waits for the socket to become writable again
/// after a short write before giving up.
const SEND_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from endpoint construction and I/O.
#[derive(Debug)]
pub enum NetError {
    /// The host/address spec did not resolve to any address.
    Resolution(String),
    /// TCP connect failed for every resolved address.
    Connect(String, io::Error),
    /// Could not bind the listening socket.
    Bind(SocketAddr, io::Error),
    /// Could not start listening on a bound socket.
    Listen(io::Error),
    /// Hard I/O error on an established connection.
    Io(io::Error),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::Resolution(spec) => write!(f, "cannot resolve '{}'", spec),
            NetError::Connect(spec, e) => write!(f, "cannot connect to '{}': {}", spec, e),
            NetError::Bind(addr, e) => write!(f, "cannot bind {}: {}", addr, e),
            NetError::Listen(e) => write!(f, "cannot start listening: {}", e),
            NetError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        NetError::Io(e)
    }
}

/// Outcome of a single non-blocking read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Orderly EOF from the peer.
    Closed,
    /// The socket had no data right now (`WouldBlock`/`Interrupted`).
    NotReady,
}

/// One established TCP stream with its own readiness poller.
///
/// The descriptor is owned exclusively and released exactly once when
/// the `Connection` is dropped, no matter how the session ended.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    poll: Poll,
    events: Events,
}

impl Connection {
    /// Connect to `host:port`, resolving via the OS resolver.
    pub fn connect(host: &str, port: u16) -> Result<Self, NetError> {
        let spec = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = spec
            .to_socket_addrs()
            .map_err(|_| NetError::Resolution(spec.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::Resolution(spec));
        }

        let mut last_err = None;
        for addr in addrs {
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nonblocking(true).map_err(NetError::Io)?;
                    return Self::from_mio(TcpStream::from_std(stream)).map_err(NetError::Io);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(NetError::Connect(
            spec,
            last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no address")),
        ))
    }

    /// Wrap an already non-blocking mio stream and register it for readiness.
    fn from_mio(mut stream: TcpStream) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, ENDPOINT_TOKEN, Interest::READABLE)?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Bounded readiness poll. Returns `false` when the timeout elapsed
    /// (or the wakeup was spurious) with no readable event.
    pub fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.events.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(self.events.iter().any(|e| e.is_readable()))
    }

    /// Non-blocking read into `buf`.
    ///
    /// Transient non-readiness (`WouldBlock`, `Interrupted`) is reported
    /// as `NotReady`, distinct from both orderly close and hard errors.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::NotReady),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::NotReady),
            Err(e) => Err(e),
        }
    }

    /// Write all of `bytes`, waiting (bounded) for writability on a full
    /// socket buffer. Returns `Ok(false)` if the peer closed mid-write.
    pub fn send(&mut self, bytes: &[u8]) -> Result<bool, NetError> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(0) => return Ok(false),
                Ok(n) => remaining = &remaining[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.await_writable(SEND_READY_TIMEOUT)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(NetError::Io(e)),
            }
        }
        Ok(true)
    }

    /// Wait until the stream is writable, at most `timeout`.
    ///
    /// Interest is flipped to WRITABLE for the wait and restored to
    /// READABLE afterwards; the re-registration re-arms any pending
    /// read readiness under edge triggering.
    fn await_writable(&mut self, timeout: Duration) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut self.stream, ENDPOINT_TOKEN, Interest::WRITABLE)?;

        let deadline = Instant::now() + timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "socket not writable within timeout",
                ));
            }
            self.events.clear();
            match self.poll.poll(&mut self.events, Some(remaining)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
            if self.events.iter().any(|e| e.is_writable()) {
                break Ok(());
            }
        };

        self.poll
            .registry()
            .reregister(&mut self.stream, ENDPOINT_TOKEN, Interest::READABLE)?;
        result
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

/// A listening TCP endpoint with its own readiness poller.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    poll: Poll,
    events: Events,
}

impl Listener {
    /// Resolve `spec` (e.g. `0.0.0.0:13232`) and start listening on it.
    pub fn bind(spec: &str) -> Result<Self, NetError> {
        let addr = spec
            .to_socket_addrs()
            .map_err(|_| NetError::Resolution(spec.to_string()))?
            .next()
            .ok_or_else(|| NetError::Resolution(spec.to_string()))?;

        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(NetError::Io)?;

        socket.set_reuse_address(true).map_err(NetError::Io)?;
        socket.set_nonblocking(true).map_err(NetError::Io)?;
        socket
            .bind(&addr.into())
            .map_err(|e| NetError::Bind(addr, e))?;
        socket.listen(128).map_err(NetError::Listen)?;

        let mut inner = TcpListener::from_std(socket.into());
        let poll = Poll::new().map_err(NetError::Io)?;
        poll.registry()
            .register(&mut inner, ENDPOINT_TOKEN, Interest::READABLE)
            .map_err(NetError::Io)?;

        Ok(Self {
            inner,
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Bounded poll for pending incoming connections.
    pub fn poll_incoming(&mut self, timeout: Duration) -> io::Result<bool> {
        self.events.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(self.events.iter().any(|e| e.is_readable()))
    }

    /// Accept one pending connection, or `None` if the backlog is empty.
    ///
    /// The returned `Connection` is independently owned by the caller;
    /// the listener keeps no reference to it.
    pub fn accept(&mut self) -> io::Result<Option<Connection>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                trace!(peer = %peer, "accepted stream");
                Ok(Some(Connection::from_mio(stream)?))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The locally bound address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
