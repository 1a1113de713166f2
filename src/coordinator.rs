//! Accept loop and chat-session lifecycle.
//!
//! The coordinator polls the listener with a bounded timeout. Each
//! accepted connection becomes a session task in the worker pool. When a
//! poll interval passes with no new connection and fewer clients than
//! the minimum threshold remain active, the chat session is over: the
//! cancel token is set and the pool drains gracefully.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::net::Listener;
use crate::pool::WorkerPool;
use crate::session::Session;
use crate::sink::RelayHandler;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Owns the listening endpoint, the worker pool and the cancel token
/// for one chat session.
pub struct AcceptCoordinator {
    listener: Listener,
    pool: WorkerPool,
    handler: Arc<dyn RelayHandler>,
    cancel: CancelToken,
    min_clients: usize,
    accept_timeout: Duration,
    poll_timeout: Duration,
    buffer_size: usize,
}

impl AcceptCoordinator {
    pub fn new(listener: Listener, handler: Arc<dyn RelayHandler>, config: &Config) -> Self {
        Self {
            listener,
            pool: WorkerPool::new(config.initial_workers),
            handler,
            cancel: CancelToken::new(),
            min_clients: config.min_clients,
            accept_timeout: Duration::from_secs(config.accept_timeout_secs),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            buffer_size: config.buffer_size,
        }
    }

    /// The token every spawned session observes. Useful for tests and
    /// for wiring external shutdown triggers.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the accept loop until the chat session ends, then cancel all
    /// sessions and drain the pool.
    ///
    /// The cancel-and-drain epilogue runs on every exit path, poll
    /// errors included, so live sessions always get the sentinel.
    pub fn run(mut self) -> io::Result<()> {
        let result = self.accept_loop();

        info!("Chat session over, cancelling remaining sessions");
        self.cancel.cancel();
        self.pool.shutdown();
        result
    }

    fn accept_loop(&mut self) -> io::Result<()> {
        loop {
            let ready = match self.listener.poll_incoming(self.accept_timeout) {
                Ok(ready) => ready,
                Err(e) => {
                    error!(error = %e, "Listener poll failed");
                    return Err(e);
                }
            };

            if !ready {
                let active = self.pool.unfinished_count();
                if active < self.min_clients {
                    info!(
                        active,
                        min_clients = self.min_clients,
                        "Too few clients, ending chat"
                    );
                    return Ok(());
                }
                debug!(active, "Accept timeout, chat continues");
                continue;
            }

            if self.drain_backlog()? {
                info!("Handler stopped the accept loop");
                return Ok(());
            }
        }
    }

    /// Accept everything pending (readiness is edge-triggered) and
    /// submit a session per connection. Returns whether the handler
    /// asked to stop accepting.
    fn drain_backlog(&mut self) -> io::Result<bool> {
        let mut stop_requested = false;
        while let Some(conn) = self.listener.accept()? {
            match conn.peer_addr() {
                Ok(peer) => {
                    info!(peer = %peer, "Accepted client");
                    if self.handler.on_accepted(peer) {
                        stop_requested = true;
                    }
                }
                // Peer vanished between accept and getpeername.
                Err(e) => debug!(error = %e, "Accepted client without peer address"),
            }

            let session = Session::new(
                conn,
                Arc::clone(&self.handler),
                self.cancel.clone(),
                self.poll_timeout,
                self.buffer_size,
            );
            self.pool.submit(move || {
                let end = session.run();
                debug!(end = ?end, "Session finished");
            });
        }
        Ok(stop_requested)
    }
}
