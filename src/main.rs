//! pizza-reactor: a single-threaded reactor server for pizza orders
//!
//! Clients send one integer per line; the server answers each line with an
//! acknowledgement or an error line. All connections are served by one
//! readiness-driven event loop over non-blocking sockets.
//!
//! Features:
//! - Half-duplex connections: read a request, flush the response, repeat
//! - Error isolation: a failing connection never affects the others
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
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
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        max_request_len = config.max_request_len,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        "Starting pizza-reactor server"
    );

    let server =
        Server::bind(&config).inspect_err(|e| error!(error = %e, "Failed to start server"))?;
    let signals = server::install_signal_handler(server.shutdown_handle())?;

    let result = server.run();
    signals.close();
    result?;

    Ok(())
}
