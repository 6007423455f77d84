//! The forwarding event loop.
//!
//! A single thread waits on one [`Poll`] for every listener and tunnel socket
//! and moves bytes between paired streams in bounded, non-blocking steps.
//! mio reports readiness edge-triggered: a handler that stops before seeing
//! `WouldBlock` queues its own readiness kind again, and the next wait turns
//! into a non-blocking poll while such carried-over work exists.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use eyre::eyre;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::mapping::Mapping;
use crate::registry::{Endpoint, Registry};
use crate::shutdown::ShutdownHandle;

/// Largest single read from a socket.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Backlog at which the producing side of a tunnel stops reading.
pub const HIGH_WATERMARK: usize = 1024 * 1024;

/// Backlog at which a paused producer resumes reading.
pub const LOW_WATERMARK: usize = HIGH_WATERMARK / 4;

const WAKER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Readiness {
    Accept,
    Connect,
    Read,
    Write,
}

/// Work for one pass of the loop. A fresh event and a carried-over entry
/// often name the same handler; each pair is dispatched once, in the order
/// it first arrived.
#[derive(Default)]
struct ReadySet {
    order: Vec<(Token, Readiness)>,
    seen: HashSet<(Token, Readiness)>,
}

impl ReadySet {
    fn push(&mut self, token: Token, readiness: Readiness) {
        if self.seen.insert((token, readiness)) {
            self.order.push((token, readiness));
        }
    }

    fn drain(&mut self) -> std::vec::Drain<'_, (Token, Readiness)> {
        self.seen.clear();
        self.order.drain(..)
    }
}

/// How the accept handler goes on after `accept` failed.
#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
    /// Backlog is empty; the next edge brings more.
    Drained,
    /// Retry on the next pass without logging.
    Transient,
    /// Retry on the next pass. Pending clients would otherwise wait for a
    /// new edge that may never come.
    Failing,
}

fn accept_failure(err: &io::Error) -> AcceptFailure {
    match err.kind() {
        io::ErrorKind::WouldBlock => AcceptFailure::Drained,
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => AcceptFailure::Transient,
        _ => AcceptFailure::Failing,
    }
}

/// A client being connected through a mapping, for log lines.
struct Attempt<'a> {
    client: SocketAddr,
    mapping: &'a Mapping,
    remote: SocketAddr,
}

impl fmt::Display for Attempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {} for {}", self.client, self.remote, self.mapping)
    }
}

pub struct Proxy {
    poll: Poll,
    events: Events,
    mappings: Vec<Mapping>,
    registry: Registry,
    shutdown: ShutdownHandle,
    /// Loop-thread scratch space for reads. Contents are only meaningful
    /// during a single read call and are copied out before queueing.
    scratch: Vec<u8>,
    /// Readiness carried over to the next iteration.
    again: VecDeque<(Token, Readiness)>,
    bound: Vec<(String, SocketAddr)>,
}

impl Proxy {
    /// Creates the poll and binds one listener per configured mapping.
    /// A mapping whose port can not be bound is logged and skipped.
    pub fn new(mappings: impl IntoIterator<Item = Mapping>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let registry = Registry::new(poll.registry().try_clone()?, WAKER.0 + 1);

        let mut proxy = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            mappings: mappings.into_iter().collect(),
            registry,
            shutdown: ShutdownHandle::new(waker),
            scratch: vec![0; CHUNK_SIZE],
            again: VecDeque::new(),
            bound: Vec::new(),
        };
        proxy.listen();
        Ok(proxy)
    }

    fn listen(&mut self) {
        for (index, mapping) in self.mappings.iter().enumerate() {
            let Some(addr) = mapping.listen_addr().filter(|_| mapping.is_configured()) else {
                tracing::warn!("Mapping {mapping} is not fully configured, skipped");
                continue;
            };

            tracing::info!("Bind to {addr} for mapping {mapping}");
            let listener = match TcpListener::bind(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("Error while binding to {addr}, mapping '{}' skipped: {e}", mapping.name());
                    continue;
                }
            };
            let local = listener.local_addr().unwrap_or(addr);
            match self.registry.add_listener(listener, index) {
                Ok(_) => self.bound.push((mapping.name().to_string(), local)),
                Err(e) => tracing::error!("failed to register listener for '{}': {e}", mapping.name()),
            }
        }
    }

    /// Mappings that are being served, with the address their listener holds.
    pub fn bound(&self) -> &[(String, SocketAddr)] {
        &self.bound
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the loop on a dedicated thread.
    pub fn spawn(self) -> io::Result<Running> {
        let shutdown = self.shutdown_handle();
        let thread = thread::Builder::new()
            .name("forwarder".into())
            .spawn(move || self.run())?;
        Ok(Running { shutdown, thread })
    }

    /// Blocks until shutdown is requested, then closes every socket.
    pub fn run(mut self) {
        if self.bound.is_empty() {
            tracing::warn!("No mapping is being served");
        }

        let mut ready = ReadySet::default();
        while !self.shutdown.is_requested() {
            let timeout = if self.again.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("readiness wait failed, stopping: {e}");
                break;
            }
            if self.shutdown.is_requested() {
                break;
            }

            for event in self.events.iter() {
                classify(&self.registry, event, &mut ready);
            }
            for (token, readiness) in self.again.drain(..) {
                ready.push(token, readiness);
            }

            for (token, readiness) in ready.drain() {
                // Closed by a handler earlier in this pass.
                if !self.registry.contains(token) {
                    continue;
                }
                self.dispatch(token, readiness);
            }
        }

        self.close_all();
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        tracing::trace!("{readiness:?} on {token:?}");
        match readiness {
            Readiness::Accept => self.accept(token),
            Readiness::Connect => self.finish_connect(token),
            Readiness::Read => self.read(token),
            Readiness::Write => self.write(token),
        }
    }

    fn accept(&mut self, token: Token) {
        let Some(Endpoint::Listener(listening)) = self.registry.get_mut(token) else {
            return;
        };
        let mapping = &self.mappings[listening.mapping];

        let (local, client) = match listening.listener.accept() {
            Ok(accepted) => {
                if listening.failing {
                    tracing::info!("accept recovered for mapping '{}'", mapping.name());
                    listening.failing = false;
                }
                accepted
            }
            Err(e) => {
                match accept_failure(&e) {
                    AcceptFailure::Drained => return,
                    AcceptFailure::Transient => {}
                    // Logged once per streak; the retry runs every pass
                    // until sockets are released.
                    AcceptFailure::Failing if !listening.failing => {
                        tracing::error!("accept failed for mapping '{}': {e}", mapping.name());
                        listening.failing = true;
                    }
                    AcceptFailure::Failing => {}
                }
                self.again.push_back((token, Readiness::Accept));
                return;
            }
        };
        // One connection per step; the listener may have more pending.
        self.again.push_back((token, Readiness::Accept));

        let remote_addr = match mapping.remote_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("Can not resolve remote address of {mapping}, dropping client {client}: {e}");
                return;
            }
        };
        let attempt = Attempt {
            client,
            mapping,
            remote: remote_addr,
        };
        tracing::info!("Attempting connect {attempt}");

        let remote = match TcpStream::connect(remote_addr) {
            Ok(remote) => remote,
            Err(e) if expected(&e) => {
                tracing::info!("Connect {attempt}: {e}");
                return;
            }
            Err(e) => {
                tracing::error!("Connect {attempt} failed: {e}");
                return;
            }
        };
        match self.registry.add_tunnel(local, remote) {
            Ok(tunnel) => tracing::debug!("Tunnel pair {:?} {:?}", tunnel.local, tunnel.remote),
            Err(e) => tracing::error!("failed to register tunnel {attempt}: {e}"),
        }
    }

    fn finish_connect(&mut self, token: Token) {
        let Some(stream) = self.registry.stream_mut(token) else {
            return;
        };
        if !stream.connecting {
            return;
        }

        let outcome = match stream.socket.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.socket.peer_addr() {
                Ok(addr) => Ok(Some(addr)),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
                Err(e) => Err(e),
            },
        };

        match outcome {
            // Handshake still in flight, wait for the next event.
            Ok(None) => {}
            Ok(Some(addr)) => {
                stream.connecting = false;
                tracing::debug!("Connected {token:?} to {addr}");
                if let Err(e) = self
                    .registry
                    .set_interest(token, Interest::READABLE | Interest::WRITABLE)
                {
                    report(token, "re-register", &e);
                    self.close_both(token);
                    return;
                }
                self.write(token);
            }
            Err(e) => {
                report(token, "connect", &e);
                self.close_both(token);
            }
        }
    }

    fn read(&mut self, token: Token) {
        let Some(stream) = self.registry.stream_mut(token) else {
            return;
        };
        if stream.paused {
            return;
        }

        let n = match stream.socket.read(&mut self.scratch) {
            Ok(0) => {
                tracing::debug!("End of stream on {} {token:?}", stream.side);
                self.close_both(token);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.again.push_back((token, Readiness::Read));
                return;
            }
            Err(e) => {
                report(token, "read", &e);
                self.close_both(token);
                return;
            }
        };
        stream.bytes_read += n as u64;
        let peer = stream.peer;
        self.again.push_back((token, Readiness::Read));

        let Some(target) = self.registry.stream_mut(peer) else {
            tracing::trace!("Dropping {n} bytes from {token:?}, peer {peer:?} is closed");
            return;
        };
        target.queue.push(self.scratch[..n].to_vec());
        let backlog = target.queue.len();
        // A connecting peer evaluates its queue once the handshake completes.
        let arm = !target.connecting;

        if arm {
            if let Err(e) = self.registry.arm_write(peer) {
                report(peer, "re-register", &e);
                self.close_both(peer);
                return;
            }
        }
        if backlog >= HIGH_WATERMARK {
            if let Some(stream) = self.registry.stream_mut(token) {
                tracing::debug!("Pausing reads on {token:?}, {backlog} bytes queued for {peer:?}");
                stream.paused = true;
            }
        }
    }

    fn write(&mut self, token: Token) {
        let Some(stream) = self.registry.stream_mut(token) else {
            return;
        };
        if stream.connecting {
            return;
        }

        while let Some(front) = stream.queue.front() {
            let offered = front.len();
            match stream.socket.write(front) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    report(token, "write", &e);
                    self.close_both(token);
                    return;
                }
                Ok(n) => {
                    stream.bytes_written += n as u64;
                    stream.queue.consume(n);
                    if n < offered {
                        // Send buffer is full; pick up the remainder next pass.
                        self.again.push_back((token, Readiness::Write));
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    report(token, "write", &e);
                    self.close_both(token);
                    return;
                }
            }
        }

        let drained = stream.queue.is_empty();
        let backlog = stream.queue.len();
        let peer = stream.peer;

        if backlog <= LOW_WATERMARK {
            if let Some(producer) = self.registry.stream_mut(peer) {
                if producer.paused {
                    tracing::debug!("Resuming reads on {peer:?}");
                    producer.paused = false;
                    self.again.push_back((peer, Readiness::Read));
                }
            }
        }

        if !drained {
            return;
        }
        if self.registry.contains(peer) {
            if let Err(e) = self.registry.set_interest(token, Interest::READABLE) {
                report(token, "re-register", &e);
                self.close_both(token);
            }
        } else {
            tracing::debug!("Flushed {token:?} after its peer closed");
            self.registry.close(token);
        }
    }

    /// Closes `token` and its peer, unless the peer still has bytes to flush
    /// to its own client. That peer is closed by its write path later.
    fn close_both(&mut self, token: Token) {
        let peer = self.registry.stream(token).map(|stream| stream.peer);
        self.registry.close(token);

        let Some(peer) = peer else {
            return;
        };
        match self.registry.stream(peer) {
            Some(stream) if !stream.queue.is_empty() => {
                tracing::debug!(
                    "Keeping {peer:?} open to flush {} queued bytes",
                    stream.queue.len()
                );
            }
            Some(_) => {
                self.registry.close(peer);
            }
            None => {}
        }
    }

    fn close_all(mut self) {
        self.again.clear();
        if !self.registry.is_empty() {
            tracing::info!("Shutting down, closing {} sockets", self.registry.len());
        }
        for token in self.registry.tokens() {
            self.registry.close(token);
        }
        drop(self.registry);
        drop(self.poll);
        tracing::info!("Forwarder stopped");
    }
}

/// Translates one poll event into the handler kinds it calls for.
fn classify(registry: &Registry, event: &Event, ready: &mut ReadySet) {
    let token = event.token();
    match registry.get(token) {
        None => {}
        Some(Endpoint::Listener(_)) => ready.push(token, Readiness::Accept),
        Some(Endpoint::Stream(stream)) if stream.connecting => {
            ready.push(token, Readiness::Connect);
        }
        Some(Endpoint::Stream(_)) => {
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready.push(token, Readiness::Read);
            }
            if event.is_writable() || event.is_write_closed() {
                ready.push(token, Readiness::Write);
            }
        }
    }
}

/// Resets and refusals are part of normal operation; anything else is not.
fn expected(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn report(token: Token, op: &str, err: &io::Error) {
    if expected(err) {
        tracing::info!("{op} on {token:?}: {err}");
    } else {
        tracing::error!("{op} on {token:?} failed: {err}");
    }
}

/// A forwarder running on its own thread.
pub struct Running {
    shutdown: ShutdownHandle,
    thread: thread::JoinHandle<()>,
}

impl Running {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Requests shutdown and waits for the loop to close everything.
    pub fn stop(self) -> eyre::Result<()> {
        self.shutdown.shutdown();
        self.thread
            .join()
            .map_err(|_| eyre!("forwarder thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_set_dispatches_each_pair_once_per_pass() {
        let mut ready = ReadySet::default();
        // A fresh read edge plus the Read carried over by the last step.
        ready.push(Token(3), Readiness::Read);
        ready.push(Token(4), Readiness::Write);
        ready.push(Token(3), Readiness::Write);
        ready.push(Token(3), Readiness::Read);
        ready.push(Token(4), Readiness::Write);

        let pass: Vec<_> = ready.drain().collect();
        assert_eq!(
            pass,
            [
                (Token(3), Readiness::Read),
                (Token(4), Readiness::Write),
                (Token(3), Readiness::Write),
            ]
        );

        // The next pass starts from scratch.
        ready.push(Token(3), Readiness::Read);
        assert_eq!(ready.drain().collect::<Vec<_>>(), [(Token(3), Readiness::Read)]);
        assert_eq!(ready.drain().count(), 0);
    }

    #[test]
    fn only_an_empty_backlog_stops_accepting() {
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(accept_failure(&would_block), AcceptFailure::Drained);
        for kind in [io::ErrorKind::Interrupted, io::ErrorKind::ConnectionAborted] {
            assert_eq!(accept_failure(&io::Error::from(kind)), AcceptFailure::Transient);
        }

        // EMFILE: the process ran out of descriptors.
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_failure(&exhausted), AcceptFailure::Failing);
        let other = io::Error::new(io::ErrorKind::Other, "no buffer space");
        assert_eq!(accept_failure(&other), AcceptFailure::Failing);
    }

    #[test]
    fn connect_attempt_names_client_and_mapping() {
        let mapping = Mapping::new("db", 15432, "db.internal", 5432);
        let attempt = Attempt {
            client: "127.0.0.1:50000".parse().unwrap(),
            mapping: &mapping,
            remote: "10.0.0.7:5432".parse().unwrap(),
        };
        let line = attempt.to_string();
        assert!(line.starts_with("127.0.0.1:50000 to 10.0.0.7:5432 for "), "{line}");
        assert!(line.contains(&mapping.to_string()), "{line}");
    }
}
