//! In-memory multiplexer for driving the event loop in tests.
//!
//! Readiness is level-triggered and recomputed from the scripted streams on
//! every wait. The ready list of each wake is shuffled with a seeded
//! generator, so descriptors come back in an arbitrary but reproducible
//! order. Registration is checked strictly: registering a token twice or
//! re-arming/removing an unknown stream is an error, which catches any drift
//! between the connection table and the multiplexer.

use crate::runtime::{Accept, InterestKind, Multiplexer, Notify, Ready, WAKER_TOKEN};
use mio::Token;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

enum Chunk {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct Pipe {
    inbound: VecDeque<Chunk>,
    outbound: Vec<u8>,
    write_limit: Option<usize>,
    write_blocked: bool,
    reads: usize,
    token: Option<Token>,
    closed: bool,
}

/// Server side of a scripted connection.
pub(crate) struct SimStream {
    pipe: Rc<RefCell<Pipe>>,
}

/// Client side of a scripted connection.
#[derive(Clone)]
pub(crate) struct SimPeer {
    pipe: Rc<RefCell<Pipe>>,
}

/// Create a connected stream/peer pair outside of any network.
pub(crate) fn pipe() -> (SimStream, SimPeer) {
    let pipe = Rc::new(RefCell::new(Pipe::default()));
    (
        SimStream { pipe: pipe.clone() },
        SimPeer { pipe },
    )
}

impl Read for SimStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        pipe.reads += 1;
        match pipe.inbound.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Chunk::Eof) => {
                pipe.inbound.push_front(Chunk::Eof);
                Ok(0)
            }
            Some(Chunk::Fail(kind)) => Err(io::Error::new(kind, "injected failure")),
            Some(Chunk::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    pipe.inbound.push_front(Chunk::Data(data));
                }
                Ok(n)
            }
        }
    }
}

impl Write for SimStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.write_blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(pipe.write_limit.unwrap_or(usize::MAX));
        pipe.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        self.pipe.borrow_mut().closed = true;
    }
}

impl SimPeer {
    pub(crate) fn send(&self, bytes: &[u8]) {
        self.pipe
            .borrow_mut()
            .inbound
            .push_back(Chunk::Data(bytes.to_vec()));
    }

    /// Queue `bytes` as separate chunks of at most `size` bytes.
    pub(crate) fn send_chunked(&self, bytes: &[u8], size: usize) {
        for chunk in bytes.chunks(size) {
            self.send(chunk);
        }
    }

    /// Close the client's write side; reads past queued data return 0.
    pub(crate) fn hang_up(&self) {
        self.pipe.borrow_mut().inbound.push_back(Chunk::Eof);
    }

    pub(crate) fn fail(&self, kind: io::ErrorKind) {
        self.pipe.borrow_mut().inbound.push_back(Chunk::Fail(kind));
    }

    pub(crate) fn received(&self) -> Vec<u8> {
        self.pipe.borrow().outbound.clone()
    }

    pub(crate) fn received_string(&self) -> String {
        String::from_utf8(self.received()).unwrap()
    }

    /// Cap the bytes accepted by each write call.
    pub(crate) fn set_write_limit(&self, limit: Option<usize>) {
        self.pipe.borrow_mut().write_limit = limit;
    }

    /// Make writes fail with `WouldBlock` and hide write readiness.
    pub(crate) fn set_write_blocked(&self, blocked: bool) {
        self.pipe.borrow_mut().write_blocked = blocked;
    }

    pub(crate) fn reads(&self) -> usize {
        self.pipe.borrow().reads
    }

    pub(crate) fn token(&self) -> Option<Token> {
        self.pipe.borrow().token
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.pipe.borrow().closed
    }
}

struct NetState {
    pending: VecDeque<(SimStream, SocketAddr)>,
    accept_errors: VecDeque<io::ErrorKind>,
    registered: BTreeMap<Token, (Rc<RefCell<Pipe>>, InterestKind)>,
    listener: Option<Token>,
    listener_closed: bool,
    mux_closed: bool,
    injected: Vec<Ready>,
    fail_rearm: Option<Token>,
    waits: usize,
    rng: u64,
    next_port: u16,
}

/// Shared view of a simulated network, used by tests to script peers and
/// inspect registrations.
#[derive(Clone)]
pub(crate) struct SimNet {
    state: Rc<RefCell<NetState>>,
    woken: Arc<AtomicBool>,
    wakes: Arc<AtomicUsize>,
}

impl SimNet {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetState {
                pending: VecDeque::new(),
                accept_errors: VecDeque::new(),
                registered: BTreeMap::new(),
                listener: None,
                listener_closed: false,
                mux_closed: false,
                injected: Vec::new(),
                fail_rearm: None,
                waits: 0,
                rng: seed | 1,
                next_port: 40000,
            })),
            woken: Arc::new(AtomicBool::new(false)),
            wakes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn multiplexer(&self) -> SimMultiplexer {
        SimMultiplexer {
            state: self.state.clone(),
            woken: self.woken.clone(),
            wakes: self.wakes.clone(),
        }
    }

    pub(crate) fn listener(&self) -> SimListener {
        SimListener {
            state: self.state.clone(),
        }
    }

    /// Queue a new client connection for the listener.
    pub(crate) fn connect(&self) -> SimPeer {
        let (stream, peer) = pipe();
        let mut state = self.state.borrow_mut();
        let addr = SocketAddr::from(([10, 0, 0, 1], state.next_port));
        state.next_port += 1;
        state.pending.push_back((stream, addr));
        peer
    }

    pub(crate) fn fail_next_accept(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().accept_errors.push_back(kind);
    }

    /// Report `ready` in the next wake regardless of stream state.
    pub(crate) fn inject(&self, ready: Ready) {
        self.state.borrow_mut().injected.push(ready);
    }

    /// Make the next re-arm of `token` fail.
    pub(crate) fn fail_rearm(&self, token: Token) {
        self.state.borrow_mut().fail_rearm = Some(token);
    }

    pub(crate) fn registered(&self) -> usize {
        self.state.borrow().registered.len()
    }

    pub(crate) fn interest(&self, token: Token) -> Option<InterestKind> {
        self.state.borrow().registered.get(&token).map(|(_, kind)| *kind)
    }

    pub(crate) fn listener_registered(&self) -> bool {
        self.state.borrow().listener.is_some()
    }

    pub(crate) fn listener_closed(&self) -> bool {
        self.state.borrow().listener_closed
    }

    pub(crate) fn mux_closed(&self) -> bool {
        self.state.borrow().mux_closed
    }

    pub(crate) fn waits(&self) -> usize {
        self.state.borrow().waits
    }

    /// Number of `notify` calls that reached the multiplexer.
    pub(crate) fn wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }
}

impl NetState {
    fn next_random(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    fn shuffle(&mut self, ready: &mut [Ready]) {
        for i in (1..ready.len()).rev() {
            let j = (self.next_random() % (i as u64 + 1)) as usize;
            ready.swap(i, j);
        }
    }
}

pub(crate) struct SimListener {
    state: Rc<RefCell<NetState>>,
}

impl Accept for SimListener {
    type Stream = SimStream;

    fn accept(&self) -> io::Result<(SimStream, SocketAddr)> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.accept_errors.pop_front() {
            return Err(io::Error::new(kind, "injected accept failure"));
        }
        state
            .pending
            .pop_front()
            .ok_or_else(|| io::ErrorKind::WouldBlock.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 12345)))
    }
}

impl Drop for SimListener {
    fn drop(&mut self) {
        self.state.borrow_mut().listener_closed = true;
    }
}

struct SimNotify {
    woken: Arc<AtomicBool>,
    wakes: Arc<AtomicUsize>,
}

impl Notify for SimNotify {
    fn notify(&self) -> io::Result<()> {
        self.woken.store(true, Ordering::SeqCst);
        self.wakes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct SimMultiplexer {
    state: Rc<RefCell<NetState>>,
    woken: Arc<AtomicBool>,
    wakes: Arc<AtomicUsize>,
}

fn not_found(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{what} not registered"))
}

impl Multiplexer for SimMultiplexer {
    type Stream = SimStream;
    type Listener = SimListener;

    fn register_listener(&mut self, _listener: &mut SimListener, token: Token) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.listener.is_some() {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        state.listener = Some(token);
        Ok(())
    }

    fn reregister_listener(&mut self, _listener: &mut SimListener, token: Token) -> io::Result<()> {
        if self.state.borrow().listener != Some(token) {
            return Err(not_found("listener"));
        }
        Ok(())
    }

    fn deregister_listener(&mut self, _listener: &mut SimListener) -> io::Result<()> {
        self.state
            .borrow_mut()
            .listener
            .take()
            .map(|_| ())
            .ok_or_else(|| not_found("listener"))
    }

    fn register(
        &mut self,
        stream: &mut SimStream,
        token: Token,
        interest: InterestKind,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let mut pipe = stream.pipe.borrow_mut();
        if state.registered.contains_key(&token) || pipe.token.is_some() {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        pipe.token = Some(token);
        state
            .registered
            .insert(token, (stream.pipe.clone(), interest));
        Ok(())
    }

    fn reregister(
        &mut self,
        stream: &mut SimStream,
        token: Token,
        interest: InterestKind,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_rearm == Some(token) {
            state.fail_rearm = None;
            return Err(io::Error::new(io::ErrorKind::Other, "injected rearm failure"));
        }
        if stream.pipe.borrow().token != Some(token) {
            return Err(not_found("stream"));
        }
        match state.registered.get_mut(&token) {
            Some(entry) => {
                entry.1 = interest;
                Ok(())
            }
            None => Err(not_found("stream")),
        }
    }

    fn deregister(&mut self, stream: &mut SimStream) -> io::Result<()> {
        let token = stream
            .pipe
            .borrow_mut()
            .token
            .take()
            .ok_or_else(|| not_found("stream"))?;
        self.state
            .borrow_mut()
            .registered
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| not_found("stream"))
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        Arc::new(SimNotify {
            woken: self.woken.clone(),
            wakes: self.wakes.clone(),
        })
    }

    fn wait(&mut self, ready: &mut Vec<Ready>, _timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.waits += 1;

        let start = ready.len();
        if let Some(token) = state.listener {
            if !state.pending.is_empty() || !state.accept_errors.is_empty() {
                ready.push(Ready::readable(token));
            }
        }

        for (token, (pipe, interest)) in &state.registered {
            let pipe = pipe.borrow();
            match interest {
                InterestKind::Read if !pipe.inbound.is_empty() => {
                    ready.push(Ready::readable(*token));
                }
                InterestKind::Write if !pipe.write_blocked => {
                    ready.push(Ready::writable(*token));
                }
                _ => {}
            }
        }

        let injected = std::mem::take(&mut state.injected);
        ready.extend(injected);

        if self.woken.swap(false, Ordering::SeqCst) {
            ready.push(Ready::readable(WAKER_TOKEN));
        }

        state.shuffle(&mut ready[start..]);
        Ok(())
    }
}

impl Drop for SimMultiplexer {
    fn drop(&mut self) {
        self.state.borrow_mut().mux_closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reads() {
        let (mut stream, peer) = pipe();
        let mut buf = [0u8; 4];

        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        peer.send(b"123456");
        peer.hang_up();
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"1234");
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_registration_is_strict() {
        let net = SimNet::new(1);
        let mut mux = net.multiplexer();
        let (mut stream, _peer) = pipe();

        mux.register(&mut stream, Token(1), InterestKind::Read).unwrap();
        assert!(mux.register(&mut stream, Token(1), InterestKind::Read).is_err());
        assert!(mux.reregister(&mut stream, Token(2), InterestKind::Write).is_err());

        mux.reregister(&mut stream, Token(1), InterestKind::Write).unwrap();
        assert_eq!(net.interest(Token(1)), Some(InterestKind::Write));

        mux.deregister(&mut stream).unwrap();
        assert!(mux.deregister(&mut stream).is_err());
        assert_eq!(net.registered(), 0);
    }

    #[test]
    fn test_level_triggered_readiness() {
        let net = SimNet::new(7);
        let mut mux = net.multiplexer();
        let (mut a, peer_a) = pipe();
        let (mut b, _peer_b) = pipe();
        mux.register(&mut a, Token(1), InterestKind::Read).unwrap();
        mux.register(&mut b, Token(2), InterestKind::Write).unwrap();

        let mut ready = Vec::new();
        mux.wait(&mut ready, None).unwrap();
        assert_eq!(ready, vec![Ready::writable(Token(2))]);

        peer_a.send(b"x");
        ready.clear();
        mux.wait(&mut ready, None).unwrap();
        assert_eq!(ready.len(), 2);
        assert!(ready.contains(&Ready::readable(Token(1))));
        assert_eq!(net.waits(), 2);
    }

    #[test]
    fn test_notify_reports_waker() {
        let net = SimNet::new(3);
        let mut mux = net.multiplexer();
        mux.notifier().notify().unwrap();

        let mut ready = Vec::new();
        mux.wait(&mut ready, None).unwrap();
        assert_eq!(ready, vec![Ready::readable(WAKER_TOKEN)]);
        assert_eq!(net.wakes(), 1);
    }
}
