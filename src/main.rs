//! chat-relay: a multi-client TCP relay
//!
//! The server accepts TCP connections, hands each one to an elastic
//! worker pool, and forwards every client's bytes into one shared,
//! mutex-guarded sink. When fewer clients than a minimum threshold stay
//! active across an idle interval, the chat session ends: every live
//! session is cancelled cooperatively and its peer receives a 3-byte
//! `BYE` sentinel.
//!
//! Features:
//! - Readiness-polled, non-blocking accept and receive loops
//! - Worker pool that grows on demand and drains on shutdown
//! - Timeout-bounded cooperative cancellation
//! - Configuration via CLI arguments or TOML file

mod cancel;
mod config;
mod coordinator;
mod net;
mod pool;
mod session;
mod sink;

use config::Config;
use coordinator::AcceptCoordinator;
use net::Listener;
use sink::SharedSink;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        min_clients = config.min_clients,
        initial_workers = config.initial_workers,
        accept_timeout_secs = config.accept_timeout_secs,
        poll_timeout_secs = config.poll_timeout_secs,
        "Starting chat-relay server"
    );

    // Startup errors (resolution, bind, listen) are fatal.
    let listener = Listener::bind(&config.listen)?;
    info!(addr = %listener.local_addr()?, "Listening");

    let sink = Arc::new(SharedSink::stdout());
    let coordinator = AcceptCoordinator::new(listener, sink, &config);
    coordinator.run()?;

    info!("Chat relay stopped");
    Ok(())
}
