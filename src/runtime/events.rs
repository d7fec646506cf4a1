//! Server lifecycle events.
//!
//! The event loop reports connects, disconnects and failures through an
//! `EventSink`. Recording is fire-and-forget: the loop never waits on the sink
//! and never looks at what it did with an event.

use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side (zero-byte read).
    PeerClosed,
    /// Read, write or registration failure on this connection.
    Error(String),
    /// Whole-server shutdown.
    Shutdown,
}

/// Something worth reporting about the server or one of its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Listening {
        addr: SocketAddr,
    },
    Accepted {
        conn: usize,
        peer: SocketAddr,
    },
    /// Connection dropped right after accept because the table is full.
    Rejected {
        peer: SocketAddr,
    },
    AcceptFailed {
        error: String,
    },
    /// Responses queued for one or more complete requests.
    Replied {
        conn: usize,
        peer: SocketAddr,
        responses: usize,
    },
    Closed {
        conn: usize,
        peer: SocketAddr,
        reason: CloseReason,
    },
    Stopped {
        connections: usize,
    },
}

impl ServerEvent {
    /// Short event-kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Listening { .. } => "listening",
            ServerEvent::Accepted { .. } => "accepted",
            ServerEvent::Rejected { .. } => "rejected",
            ServerEvent::AcceptFailed { .. } => "accept_failed",
            ServerEvent::Replied { .. } => "replied",
            ServerEvent::Closed { .. } => "closed",
            ServerEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Receiver for server events.
pub trait EventSink {
    fn record(&self, event: ServerEvent);
}

/// Sink that forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ServerEvent) {
        let kind = event.kind();
        match event {
            ServerEvent::Listening { addr } => {
                info!(kind, addr = %addr, "Server listening for incoming connections");
            }
            ServerEvent::Accepted { conn, peer } => {
                info!(kind, conn, peer = %peer, "Accepted connection");
            }
            ServerEvent::Rejected { peer } => {
                warn!(kind, peer = %peer, "Connection limit reached");
            }
            ServerEvent::AcceptFailed { error } => {
                warn!(kind, error = %error, "Accept error");
            }
            ServerEvent::Replied {
                conn,
                peer,
                responses,
            } => {
                debug!(kind, conn, peer = %peer, responses, "Sending responses");
            }
            ServerEvent::Closed {
                conn,
                peer,
                reason: CloseReason::Error(error),
            } => {
                warn!(kind, conn, peer = %peer, error = %error, "Connection error");
            }
            ServerEvent::Closed { conn, peer, reason } => {
                info!(kind, conn, peer = %peer, reason = ?reason, "Connection closed");
            }
            ServerEvent::Stopped { connections } => {
                info!(kind, connections, "Server stopped");
            }
        }
    }
}
