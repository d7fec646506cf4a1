//! mio-based multiplexer.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Registrations are edge-triggered; the dispatcher re-arms a descriptor
//! after every bounded read or write so leftover readiness is reported again.

use crate::runtime::{Accept, InterestKind, Multiplexer, Notify, Ready, WAKER_TOKEN};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Multiplexer backed by a mio `Poll`.
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl MioMultiplexer {
    /// Create the poll instance and its wake channel.
    ///
    /// `capacity` bounds how many ready descriptors one wait reports.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            waker,
        })
    }
}

fn interest(kind: InterestKind) -> Interest {
    match kind {
        InterestKind::Read => Interest::READABLE,
        InterestKind::Write => Interest::WRITABLE,
    }
}

impl Multiplexer for MioMultiplexer {
    type Stream = TcpStream;
    type Listener = TcpListener;

    fn register_listener(&mut self, listener: &mut TcpListener, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, token, Interest::READABLE)
    }

    fn reregister_listener(&mut self, listener: &mut TcpListener, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(listener, token, Interest::READABLE)
    }

    fn deregister_listener(&mut self, listener: &mut TcpListener) -> io::Result<()> {
        self.poll.registry().deregister(listener)
    }

    fn register(
        &mut self,
        stream: &mut TcpStream,
        token: Token,
        kind: InterestKind,
    ) -> io::Result<()> {
        self.poll.registry().register(stream, token, interest(kind))
    }

    fn reregister(
        &mut self,
        stream: &mut TcpStream,
        token: Token,
        kind: InterestKind,
    ) -> io::Result<()> {
        self.poll.registry().reregister(stream, token, interest(kind))
    }

    fn deregister(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        self.waker.clone()
    }

    fn wait(&mut self, ready: &mut Vec<Ready>, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }));
        Ok(())
    }
}

impl Notify for Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Create a non-blocking listening socket bound to `addr`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into()))
}
