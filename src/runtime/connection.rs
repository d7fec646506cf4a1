//! Connection state machine for managing client connections.
//!
//! A connection alternates between reading requests and flushing the
//! responses they produced, and is armed for exactly one of the two at any
//! instant. While responses are draining nothing is read, so a slow reader
//! throttles only itself.
//!
//! Every step performs at most one read or one write of bounded size; the
//! event loop re-arms the connection afterwards if more work remains.

use crate::protocols::pizza;
use crate::runtime::InterestKind;
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Armed for reads, accumulating request bytes.
    Reading,
    /// Armed for writes, draining queued responses.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
    /// Terminal. Buffers released, no further events.
    Closed,
}

/// Outcome of one read or write step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing happened: the socket was not ready or the step did not
    /// match the current state.
    Idle,
    /// Bytes buffered, no complete request yet.
    Buffered,
    /// Responses queued for this many requests; now writing.
    Queued(usize),
    /// Some of the queued bytes went out.
    Partial,
    /// Everything queued went out; reading again.
    Flushed,
    /// Zero-byte read.
    PeerClosed,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_request_len: usize,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in initial reading state.
    pub fn new(stream: S, peer: SocketAddr, max_request_len: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            max_request_len,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// The single interest this connection should be armed for.
    pub fn interest(&self) -> Option<InterestKind> {
        match self.state {
            ConnState::Reading => Some(InterestKind::Read),
            ConnState::Writing { .. } => Some(InterestKind::Write),
            ConnState::Closed => None,
        }
    }

    /// Read once into `scratch` and answer every request it completes.
    ///
    /// Responses are queued in request order. A line, complete or not,
    /// longer than the request limit fails the connection with `InvalidData`.
    pub fn on_readable(&mut self, scratch: &mut [u8]) -> io::Result<Progress> {
        if self.state != ConnState::Reading {
            return Ok(Progress::Idle);
        }

        let n = match self.stream.read(scratch) {
            Ok(0) => return Ok(Progress::PeerClosed),
            Ok(n) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(Progress::Idle)
            }
            Err(e) => return Err(e),
        };
        self.read_buf.extend_from_slice(&scratch[..n]);

        let mut responses = 0;
        while let Some(frame) = pizza::next_frame(&mut self.read_buf) {
            if frame.len() - 1 > self.max_request_len {
                return Err(self.too_long());
            }
            let request = pizza::decode(&frame);
            if let pizza::Request::Invalid(raw) = &request {
                trace!(peer = %self.peer, raw = raw.trim_end(), "Unparseable order");
            }
            self.write_buf.extend_from_slice(&pizza::encode(&request));
            responses += 1;
        }

        if self.read_buf.len() > self.max_request_len {
            return Err(self.too_long());
        }

        if responses == 0 {
            return Ok(Progress::Buffered);
        }

        self.state = ConnState::Writing {
            written: 0,
            total: self.write_buf.len(),
        };
        Ok(Progress::Queued(responses))
    }

    /// Write at most `max_chunk` queued bytes.
    pub fn on_writable(&mut self, max_chunk: usize) -> io::Result<Progress> {
        let (written, total) = match self.state {
            ConnState::Writing { written, total } => (written, total),
            _ => return Ok(Progress::Idle),
        };

        let end = total.min(written + max_chunk);
        let n = match self.stream.write(&self.write_buf[written..end]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(Progress::Idle)
            }
            Err(e) => return Err(e),
        };

        let written = written + n;
        if written >= total {
            self.write_buf.clear();
            self.state = ConnState::Reading;
            Ok(Progress::Flushed)
        } else {
            self.state = ConnState::Writing { written, total };
            Ok(Progress::Partial)
        }
    }

    fn too_long(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request exceeds {} bytes", self.max_request_len),
        )
    }

    /// Mark the connection closed and release its buffers.
    ///
    /// The socket itself closes when the connection is dropped.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
        self.read_buf = BytesMut::new();
        self.write_buf = BytesMut::new();
    }
}
