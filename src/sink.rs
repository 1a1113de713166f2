//! Relay handler interface and the shared writer sink.
//!
//! One `SharedSink` instance serves a whole chat session: every session
//! funnels its received chunks through `on_data`, and the internal lock
//! guarantees that two sessions' chunks never interleave within one call.
//! No ordering is guaranteed across calls from different sessions.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::warn;

/// Fixed interface for the accept and receive loops.
///
/// Either hook may return `true` to stop its caller: `on_accepted` stops
/// the accept loop, `on_data` ends the calling session.
pub trait RelayHandler: Send + Sync {
    /// A connection was accepted. Return `true` to stop accepting.
    fn on_accepted(&self, _peer: SocketAddr) -> bool {
        false
    }

    /// One received chunk, in full. Return `true` to end the session.
    fn on_data(&self, bytes: &[u8]) -> bool;
}

/// Mutex-guarded writer consuming every session's bytes.
pub struct SharedSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> SharedSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> SharedSink<W> {
    /// Consume the sink and hand back the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl SharedSink<io::Stdout> {
    /// The production sink: forward every client's bytes to stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> RelayHandler for SharedSink<W> {
    /// Writes the chunk in full under the lock. Never requests
    /// termination; only peer closure or cancellation end a session.
    fn on_data(&self, bytes: &[u8]) -> bool {
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writer.write_all(bytes).and_then(|_| writer.flush()) {
            warn!(error = %e, "Sink write failed, dropping chunk");
        }
        false
    }
}
