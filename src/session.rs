//! Per-connection receive loop.
//!
//! A session owns its connection outright and drives it alone: poll for
//! readability with a bounded timeout, drain whatever arrived into the
//! handler, repeat. The cancel token is checked once per poll interval,
//! so cancellation is observed within one interval at worst.

use crate::cancel::CancelToken;
use crate::net::{Connection, ReadOutcome};
use crate::sink::RelayHandler;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Sent to the peer when the chat session is shut down from the
/// server side. Not negotiated, not escaped.
pub const SHUTDOWN_SENTINEL: &[u8; 3] = b"BYE";

/// Why a session's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Orderly close by the peer, or a hard receive error.
    PeerClosed,
    /// The handler returned `true` from `on_data`.
    HandlerRequested,
    /// The shared cancel token was set; the shutdown sentinel has been
    /// sent to the peer (best effort).
    Cancelled,
}

/// One client's receive loop, run as a worker-pool task.
pub struct Session {
    conn: Connection,
    handler: Arc<dyn RelayHandler>,
    cancel: CancelToken,
    poll_timeout: Duration,
    buffer_size: usize,
}

impl Session {
    pub fn new(
        conn: Connection,
        handler: Arc<dyn RelayHandler>,
        cancel: CancelToken,
        poll_timeout: Duration,
        buffer_size: usize,
    ) -> Self {
        Self {
            conn,
            handler,
            cancel,
            poll_timeout,
            buffer_size,
        }
    }

    /// Run the receive loop to completion, consuming the session and
    /// releasing the connection on return.
    pub fn run(mut self) -> SessionEnd {
        let mut buf = BytesMut::zeroed(self.buffer_size);

        while !self.cancel.is_cancelled() {
            match self.conn.poll_readable(self.poll_timeout) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    debug!(error = %e, "Readiness poll failed, ending session");
                    return SessionEnd::PeerClosed;
                }
            }

            // Readiness is edge-triggered: drain the socket before the
            // next poll. A large message reaches the handler as several
            // buffer-sized chunks; no reassembly here.
            loop {
                match self.conn.receive(&mut buf) {
                    Ok(ReadOutcome::Data(n)) => {
                        trace!(bytes = n, "Forwarding chunk");
                        if self.handler.on_data(&buf[..n]) {
                            debug!("Handler requested termination");
                            return SessionEnd::HandlerRequested;
                        }
                    }
                    Ok(ReadOutcome::Closed) => {
                        debug!("Peer closed connection");
                        return SessionEnd::PeerClosed;
                    }
                    Ok(ReadOutcome::NotReady) => break,
                    Err(e) => {
                        // Hard receive errors end the session quietly;
                        // other participants are not disturbed.
                        debug!(error = %e, "Receive failed, ending session");
                        return SessionEnd::PeerClosed;
                    }
                }
                if self.cancel.is_cancelled() {
                    break;
                }
            }
        }

        // Coordinated shutdown: tell the peer the chat is over.
        match self.conn.send(SHUTDOWN_SENTINEL) {
            Ok(sent) => trace!(sent, "Shutdown sentinel"),
            Err(e) => debug!(error = %e, "Failed to send shutdown sentinel"),
        }
        SessionEnd::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Listener;
    use crate::sink::SharedSink;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    const FAST_POLL: Duration = Duration::from_millis(50);

    /// Handler that records every chunk and can be told to request
    /// termination after a number of calls.
    struct RecordingHandler {
        chunks: Mutex<Vec<Vec<u8>>>,
        calls: AtomicUsize,
        terminate_after: usize,
    }

    impl RecordingHandler {
        fn new(terminate_after: usize) -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                terminate_after,
            }
        }

        fn concatenated(&self) -> Vec<u8> {
            self.chunks.lock().unwrap().concat()
        }
    }

    impl RelayHandler for RecordingHandler {
        fn on_data(&self, bytes: &[u8]) -> bool {
            self.chunks.lock().unwrap().push(bytes.to_vec());
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.terminate_after
        }
    }

    /// Accept one connection from a std client and wrap it in a session.
    fn session_pair(
        handler: Arc<dyn RelayHandler>,
        cancel: CancelToken,
    ) -> (Session, std::net::TcpStream) {
        let mut listener = Listener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        assert!(listener.poll_incoming(Duration::from_secs(2)).unwrap());
        let conn = listener.accept().unwrap().expect("pending connection");
        let session = Session::new(conn, handler, cancel, FAST_POLL, 1024);
        (session, peer)
    }

    #[test]
    fn test_peer_close_ends_session_without_handler_call() {
        let handler = Arc::new(RecordingHandler::new(usize::MAX));
        let (session, peer) = session_pair(handler.clone(), CancelToken::new());
        drop(peer);

        assert_eq!(session.run(), SessionEnd::PeerClosed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_received_bytes_reach_handler_byte_exact() {
        let handler = Arc::new(RecordingHandler::new(usize::MAX));
        let (session, mut peer) = session_pair(handler.clone(), CancelToken::new());

        let runner = thread::spawn(move || session.run());
        peer.write_all(b"hello ").unwrap();
        drop(peer);

        assert_eq!(runner.join().unwrap(), SessionEnd::PeerClosed);
        assert_eq!(handler.concatenated(), b"hello ");
    }

    #[test]
    fn test_large_message_arrives_in_buffer_sized_chunks() {
        let handler = Arc::new(RecordingHandler::new(usize::MAX));
        let (session, mut peer) = session_pair(handler.clone(), CancelToken::new());

        let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let runner = thread::spawn(move || session.run());
        peer.write_all(&message).unwrap();
        drop(peer);

        assert_eq!(runner.join().unwrap(), SessionEnd::PeerClosed);
        let chunks = handler.chunks.lock().unwrap();
        assert!(chunks.len() >= 5, "expected several 1024-byte chunks");
        assert!(chunks.iter().all(|c| c.len() <= 1024));
        assert_eq!(chunks.concat(), message);
    }

    #[test]
    fn test_handler_request_ends_session() {
        let handler = Arc::new(RecordingHandler::new(1));
        let (session, mut peer) = session_pair(handler.clone(), CancelToken::new());

        let runner = thread::spawn(move || session.run());
        peer.write_all(b"stop now").unwrap();

        assert_eq!(runner.join().unwrap(), SessionEnd::HandlerRequested);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_sends_sentinel_and_ends_session() {
        let handler = Arc::new(RecordingHandler::new(usize::MAX));
        let cancel = CancelToken::new();
        let (session, mut peer) = session_pair(handler.clone(), cancel.clone());

        let runner = thread::spawn(move || session.run());
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        assert_eq!(runner.join().unwrap(), SessionEnd::Cancelled);

        let mut received = Vec::new();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, SHUTDOWN_SENTINEL);
    }

    #[test]
    fn test_pre_cancelled_session_skips_receive() {
        let handler = Arc::new(RecordingHandler::new(usize::MAX));
        let cancel = CancelToken::new();
        cancel.cancel();
        let (session, mut peer) = session_pair(handler.clone(), cancel);

        assert_eq!(session.run(), SessionEnd::Cancelled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        let mut sentinel = [0u8; 3];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        peer.read_exact(&mut sentinel).unwrap();
        assert_eq!(&sentinel, SHUTDOWN_SENTINEL);
    }

    #[test]
    fn test_sink_handler_end_to_end() {
        let sink = Arc::new(SharedSink::new(Vec::new()));
        let (session, mut peer) = session_pair(sink.clone(), CancelToken::new());

        let runner = thread::spawn(move || session.run());
        peer.write_all(b"hello ").unwrap();
        drop(peer);
        runner.join().unwrap();

        // Reach into the sink's writer to verify byte-exact forwarding.
        let sink = Arc::try_unwrap(sink).ok().expect("sole reference");
        let written = sink.into_inner();
        assert_eq!(written, b"hello ");
    }
}
