//! Server lifecycle: bind, run, stop.
//!
//! `Server::bind` opens the listening socket and registers it for accepts.
//! `Server::run` blocks the calling thread in the event loop until a
//! `ShutdownHandle` asks it to stop, then closes every connection, the
//! multiplexer and the listener before returning.

use crate::config::Config;
use crate::runtime::mio::{bind_listener, MioMultiplexer};
use crate::runtime::{Dispatcher, EventSink, Multiplexer, ShutdownHandle, TracingSink};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::info;

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be resolved or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up readiness multiplexer: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("event loop failed: {0}")]
    EventLoop(#[source] io::Error),
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),
}

/// A bound server, ready to run.
pub struct Server<M: Multiplexer = MioMultiplexer> {
    dispatcher: Dispatcher<M>,
}

impl Server {
    /// Bind the configured address, logging through `tracing`.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        Self::bind_with_sink(config, Box::new(TracingSink))
    }

    pub fn bind_with_sink(
        config: &Config,
        sink: Box<dyn EventSink + Send>,
    ) -> Result<Self, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: config.listen.clone(),
            source,
        };

        let addr = resolve(&config.listen).map_err(bind_error)?;
        let listener = bind_listener(addr).map_err(bind_error)?;
        let mux = MioMultiplexer::new(config.event_capacity).map_err(ServerError::Multiplexer)?;

        Self::from_parts(mux, listener, config, sink)
    }
}

impl<M: Multiplexer> Server<M> {
    /// Build a server over an already bound listener.
    ///
    /// On failure nothing stays registered: the listener and multiplexer
    /// are dropped with the error.
    pub fn from_parts(
        mux: M,
        listener: M::Listener,
        config: &Config,
        sink: Box<dyn EventSink + Send>,
    ) -> Result<Self, ServerError> {
        let dispatcher =
            Dispatcher::new(mux, listener, config, sink).map_err(ServerError::Multiplexer)?;
        Ok(Self { dispatcher })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr().unwrap()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.dispatcher.shutdown_handle()
    }

    /// Serve until stopped.
    pub fn run(self) -> Result<(), ServerError> {
        self.dispatcher.run().map_err(ServerError::EventLoop)
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        )
    })
}

/// Background thread that stops the server on SIGINT or SIGTERM.
pub struct SignalListener {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalListener {
    /// Stop listening for signals and join the thread.
    pub fn close(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}

/// Install SIGINT/SIGTERM handlers that call `shutdown.stop()`.
pub fn install_signal_handler(shutdown: ShutdownHandle) -> Result<SignalListener, ServerError> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(ServerError::Signal)?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            forward_signals(signals.forever(), &shutdown);
        })
        .map_err(ServerError::Signal)?;

    Ok(SignalListener { handle, thread })
}

/// Call `stop()` for every delivered signal until the iterator ends.
/// Returns how many signals were handled.
fn forward_signals(signals: impl IntoIterator<Item = i32>, shutdown: &ShutdownHandle) -> usize {
    let mut received = 0;
    for signal in signals {
        info!(signal, "Shutdown signal received");
        shutdown.stop();
        received += 1;
    }
    received
}
