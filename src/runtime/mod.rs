//! Single-threaded readiness runtime.
//!
//! The event loop never touches the OS directly. It drives three seams:
//! - `Multiplexer`: readiness wait plus registration of descriptors
//! - `Accept`: non-blocking accept on the listening socket
//! - `Notify`: forces a blocked wait to return, callable from any thread
//!
//! `mio` implements them for real sockets (epoll on Linux, kqueue on macOS).
//! Tests swap in `sim`, an in-memory multiplexer with scripted streams.

pub mod connection;
pub mod event_loop;
pub mod events;
pub mod mio;

#[cfg(test)]
pub(crate) mod sim;

pub(crate) use connection::{ConnState, Connection, Progress};
pub(crate) use event_loop::{Dispatcher, ShutdownHandle};
pub(crate) use events::{CloseReason, EventSink, ServerEvent, TracingSink};

use ::mio::Token;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token reserved for the cross-thread wake channel.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// The single event kind a descriptor is armed for.
///
/// A connection is armed for exactly one direction at any instant, so there
/// is no read+write variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestKind {
    Read,
    Write,
}

/// One readiness report from a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup reported alongside the event. The next read/write
    /// attempt surfaces the actual failure.
    pub error: bool,
}

#[cfg(test)]
impl Ready {
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            readable: true,
            writable: false,
            error: false,
        }
    }

    pub fn writable(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: true,
            error: false,
        }
    }
}

/// Listening socket that yields connected streams without blocking.
pub trait Accept {
    type Stream: Read + Write;

    /// Accept one pending connection.
    ///
    /// Returns `WouldBlock` when nothing is pending.
    fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Wakes a blocked `Multiplexer::wait` from another thread.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

/// Readiness multiplexer.
///
/// Registration calls replace the whole interest set of a descriptor.
/// `wait` appends every ready descriptor of one wake to `ready`.
pub trait Multiplexer {
    type Stream: Read + Write;
    type Listener: Accept<Stream = Self::Stream>;

    fn register_listener(&mut self, listener: &mut Self::Listener, token: Token) -> io::Result<()>;

    /// Re-arm the listener after a single accept.
    fn reregister_listener(
        &mut self,
        listener: &mut Self::Listener,
        token: Token,
    ) -> io::Result<()>;

    fn deregister_listener(&mut self, listener: &mut Self::Listener) -> io::Result<()>;

    fn register(
        &mut self,
        stream: &mut Self::Stream,
        token: Token,
        interest: InterestKind,
    ) -> io::Result<()>;

    fn reregister(
        &mut self,
        stream: &mut Self::Stream,
        token: Token,
        interest: InterestKind,
    ) -> io::Result<()>;

    fn deregister(&mut self, stream: &mut Self::Stream) -> io::Result<()>;

    /// Handle that forces the next (or current) wait to return.
    fn notifier(&self) -> Arc<dyn Notify>;

    /// Block until at least one descriptor is ready or `timeout` elapses.
    ///
    /// An interrupted wait returns `Ok` with nothing appended.
    fn wait(&mut self, ready: &mut Vec<Ready>, timeout: Option<Duration>) -> io::Result<()>;
}
