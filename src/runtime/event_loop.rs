//! Event loop (reactor).
//!
//! Readiness-based model: the multiplexer tells us which descriptors are
//! ready, then we perform one non-blocking read, write or accept per
//! descriptor. Every descriptor reported in a wake is handled before the
//! next wait.
//!
//! The dispatcher owns the multiplexer, the listener and the connection
//! table. Nothing else mutates them; another thread can only ask the loop to
//! stop through a `ShutdownHandle`, and the loop performs the close sequence
//! itself.

use crate::config::Config;
use crate::runtime::{
    Accept, CloseReason, ConnState, Connection, EventSink, InterestKind, Multiplexer, Notify,
    Progress, Ready, ServerEvent, LISTENER_TOKEN, WAKER_TOKEN,
};
use mio::Token;
use slab::Slab;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// What one ready descriptor asks the loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Accept,
    Wake,
    Read(usize),
    Write(usize),
}

/// Requests termination of a running event loop from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    notify: Arc<dyn Notify>,
}

impl ShutdownHandle {
    /// Ask the loop to stop. Safe to call repeatedly and from any thread;
    /// only the first call wakes the loop.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.notify.notify() {
                // The bounded wait timeout still ends the loop.
                debug!(error = %e, "Failed to wake event loop");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Single-threaded dispatcher over one listener and its connections.
pub struct Dispatcher<M: Multiplexer> {
    mux: M,
    listener: M::Listener,
    connections: Slab<Connection<M::Stream>>,
    running: Arc<AtomicBool>,
    sink: Box<dyn EventSink + Send>,
    /// Ready list reused across wakes.
    ready: Vec<Ready>,
    /// Connections closed during the current wake.
    closed: Vec<usize>,
    /// Fixed-size transfer buffer for reads; its length also caps writes.
    scratch: Vec<u8>,
    max_connections: usize,
    max_request_len: usize,
    poll_timeout: Duration,
}

impl<M: Multiplexer> Dispatcher<M> {
    /// Register accept interest for `listener` and build an idle loop.
    pub fn new(
        mut mux: M,
        mut listener: M::Listener,
        config: &Config,
        sink: Box<dyn EventSink + Send>,
    ) -> io::Result<Self> {
        mux.register_listener(&mut listener, LISTENER_TOKEN)?;
        let addr = listener.local_addr()?;
        sink.record(ServerEvent::Listening { addr });

        Ok(Self {
            mux,
            listener,
            connections: Slab::with_capacity(config.max_connections.min(4096)),
            running: Arc::new(AtomicBool::new(true)),
            sink,
            ready: Vec::with_capacity(config.event_capacity),
            closed: Vec::new(),
            scratch: vec![0u8; config.buffer_size],
            max_connections: config.max_connections,
            max_request_len: config.max_request_len,
            poll_timeout: config.poll_timeout,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
            notify: self.mux.notifier(),
        }
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn state(&self, conn: usize) -> Option<ConnState> {
        self.connections.get(conn).map(Connection::state)
    }

    /// Run until stopped, then close everything.
    ///
    /// A failing wait ends the loop early; the close sequence still runs
    /// and the error is returned.
    pub fn run(mut self) -> io::Result<()> {
        let mut result = Ok(());
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.turn() {
                error!(error = %e, "Event loop failed");
                result = Err(e);
                break;
            }
        }
        self.shutdown();
        result
    }

    /// One wait followed by dispatch of everything it reported.
    pub fn turn(&mut self) -> io::Result<()> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        self.mux.wait(&mut ready, Some(self.poll_timeout))?;

        self.closed.clear();
        for event in &ready {
            match self.classify(event) {
                Some(EventKind::Accept) => self.accept()?,
                Some(EventKind::Wake) => trace!("Event loop woken"),
                Some(EventKind::Read(conn)) => self.on_readable(conn),
                Some(EventKind::Write(conn)) => self.on_writable(conn),
                None => trace!(token = event.token.0, "Skipping stale event"),
            }
        }

        self.ready = ready;
        Ok(())
    }

    fn classify(&self, event: &Ready) -> Option<EventKind> {
        match event.token {
            LISTENER_TOKEN => Some(EventKind::Accept),
            WAKER_TOKEN => Some(EventKind::Wake),
            Token(conn) => {
                if self.closed.contains(&conn) {
                    return None;
                }
                match self.connections.get(conn)?.state() {
                    ConnState::Reading if event.readable || event.error => {
                        Some(EventKind::Read(conn))
                    }
                    ConnState::Writing { .. } if event.writable || event.error => {
                        Some(EventKind::Write(conn))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Accept one pending connection, then re-arm the listener.
    ///
    /// Accept failures are reported and skipped. Failing to re-arm the
    /// listener is fatal to the loop.
    fn accept(&mut self) -> io::Result<()> {
        match self.listener.accept() {
            Ok((stream, peer)) => self.admit(stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.sink.record(ServerEvent::AcceptFailed {
                error: e.to_string(),
            }),
        }
        self.mux
            .reregister_listener(&mut self.listener, LISTENER_TOKEN)
    }

    fn admit(&mut self, mut stream: M::Stream, peer: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            self.sink.record(ServerEvent::Rejected { peer });
            return;
        }

        // Insert only once registered so the table and the multiplexer
        // never disagree.
        let entry = self.connections.vacant_entry();
        let conn = entry.key();
        if let Err(e) = self
            .mux
            .register(&mut stream, Token(conn), InterestKind::Read)
        {
            self.sink.record(ServerEvent::AcceptFailed {
                error: format!("failed to register {peer}: {e}"),
            });
            return;
        }
        entry.insert(Connection::new(stream, peer, self.max_request_len));
        self.sink.record(ServerEvent::Accepted { conn, peer });
    }

    fn on_readable(&mut self, conn: usize) {
        let result = match self.connections.get_mut(conn) {
            Some(connection) => connection.on_readable(&mut self.scratch),
            None => return,
        };
        self.advance(conn, result);
    }

    fn on_writable(&mut self, conn: usize) {
        let max_chunk = self.scratch.len();
        let result = match self.connections.get_mut(conn) {
            Some(connection) => connection.on_writable(max_chunk),
            None => return,
        };
        self.advance(conn, result);
    }

    /// Apply the outcome of one step: close on EOF or error, otherwise
    /// re-arm for whichever direction the connection now needs.
    fn advance(&mut self, conn: usize, result: io::Result<Progress>) {
        let progress = match result {
            Ok(Progress::PeerClosed) => return self.close(conn, CloseReason::PeerClosed),
            Ok(progress) => progress,
            Err(e) => return self.close(conn, CloseReason::Error(e.to_string())),
        };

        let Some(connection) = self.connections.get(conn) else {
            return;
        };
        if let Progress::Queued(responses) = progress {
            self.sink.record(ServerEvent::Replied {
                conn,
                peer: connection.peer(),
                responses,
            });
        }

        let Some(kind) = connection.interest() else {
            return;
        };
        if let Err(e) = self.register_interest(conn, kind) {
            self.close(conn, CloseReason::Error(e.to_string()));
        }
    }

    /// Replace the interest set of `conn` with exactly `kind`.
    fn register_interest(&mut self, conn: usize, kind: InterestKind) -> io::Result<()> {
        match self.connections.get_mut(conn) {
            Some(connection) => self
                .mux
                .reregister(connection.stream_mut(), Token(conn), kind),
            None => Ok(()),
        }
    }

    /// Remove `conn` from the multiplexer and the table.
    ///
    /// Returns `None` if it was already gone.
    pub(crate) fn deregister(&mut self, conn: usize) -> Option<Connection<M::Stream>> {
        let mut connection = self.connections.try_remove(conn)?;
        if let Err(e) = self.mux.deregister(connection.stream_mut()) {
            debug!(conn, error = %e, "Deregister failed");
        }
        Some(connection)
    }

    fn close(&mut self, conn: usize, reason: CloseReason) {
        if let Some(mut connection) = self.deregister(conn) {
            connection.close();
            self.closed.push(conn);
            self.sink.record(ServerEvent::Closed {
                conn,
                peer: connection.peer(),
                reason,
            });
        }
    }

    /// Close every connection, then the multiplexer and the listener.
    fn shutdown(mut self) {
        let open: Vec<usize> = self.connections.iter().map(|(conn, _)| conn).collect();
        for &conn in &open {
            self.close(conn, CloseReason::Shutdown);
        }

        let Dispatcher {
            mux: mut multiplexer,
            mut listener,
            sink,
            ..
        } = self;
        if let Err(e) = multiplexer.deregister_listener(&mut listener) {
            debug!(error = %e, "Listener deregister failed");
        }
        drop(multiplexer);
        drop(listener);

        sink.record(ServerEvent::Stopped {
            connections: open.len(),
        });
    }
}
