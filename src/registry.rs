//! Bookkeeping for every socket taking part in forwarding.
//!
//! Each endpoint owns exactly one record keyed by its poll [`Token`]. Tunnel
//! sides refer to each other by token only; a token missing from the registry
//! means that side is closed. Tokens are handed out monotonically and never
//! reused, so a stale peer token can not alias a newer endpoint.

use std::collections::HashMap;
use std::fmt;
use std::io;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use crate::queue::WriteQueue;

/// Which end of a tunnel a stream endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Accepted from a client.
    Local,
    /// Connected to the mapping's remote address.
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Local => "local",
            Side::Remote => "remote",
        })
    }
}

pub struct Listening {
    pub listener: TcpListener,
    /// Index of the mapping this listener serves.
    pub mapping: usize,
    /// Last `accept` failed with a non-transient error.
    pub failing: bool,
}

pub struct Stream {
    pub socket: TcpStream,
    pub side: Side,
    pub peer: Token,
    pub queue: WriteQueue,
    /// Outbound handshake not finished yet.
    pub connecting: bool,
    /// Reads suspended until the peer's backlog drains.
    pub paused: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
    interest: Interest,
}

impl Stream {
    fn new(socket: TcpStream, side: Side, peer: Token, interest: Interest) -> Self {
        Self {
            socket,
            side,
            peer,
            queue: WriteQueue::new(),
            connecting: side == Side::Remote,
            paused: false,
            bytes_read: 0,
            bytes_written: 0,
            interest,
        }
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }
}

pub enum Endpoint {
    Listener(Listening),
    Stream(Stream),
}

/// Tokens of a freshly paired local/remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    pub local: Token,
    pub remote: Token,
}

pub struct Registry {
    handle: mio::Registry,
    endpoints: HashMap<Token, Endpoint>,
    next_token: usize,
}

impl Registry {
    /// Tokens below `first_token` are left to the caller (e.g. for a waker).
    pub fn new(handle: mio::Registry, first_token: usize) -> Self {
        Self {
            handle,
            endpoints: HashMap::new(),
            next_token: first_token,
        }
    }

    fn allocate(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn add_listener(&mut self, mut listener: TcpListener, mapping: usize) -> io::Result<Token> {
        let token = self.allocate();
        self.handle
            .register(&mut listener, token, Interest::READABLE)?;
        self.endpoints
            .insert(token, Endpoint::Listener(Listening {
                listener,
                mapping,
                failing: false,
            }));
        Ok(token)
    }

    /// Registers both sides of a new tunnel: the local side for reads, the
    /// remote side for connect completion. Either both are registered or
    /// neither is.
    pub fn add_tunnel(&mut self, mut local: TcpStream, mut remote: TcpStream) -> io::Result<Tunnel> {
        let tunnel = Tunnel {
            local: self.allocate(),
            remote: self.allocate(),
        };
        self.handle
            .register(&mut local, tunnel.local, Interest::READABLE)?;
        if let Err(e) = self
            .handle
            .register(&mut remote, tunnel.remote, Interest::WRITABLE)
        {
            if let Err(e) = self.handle.deregister(&mut local) {
                tracing::error!("failed to deregister {:?}: {e}", tunnel.local);
            }
            return Err(e);
        }

        self.endpoints.insert(
            tunnel.local,
            Endpoint::Stream(Stream::new(local, Side::Local, tunnel.remote, Interest::READABLE)),
        );
        self.endpoints.insert(
            tunnel.remote,
            Endpoint::Stream(Stream::new(remote, Side::Remote, tunnel.local, Interest::WRITABLE)),
        );
        Ok(tunnel)
    }

    pub fn get(&self, token: Token) -> Option<&Endpoint> {
        self.endpoints.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&token)
    }

    pub fn stream(&self, token: Token) -> Option<&Stream> {
        match self.endpoints.get(&token) {
            Some(Endpoint::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    pub fn stream_mut(&mut self, token: Token) -> Option<&mut Stream> {
        match self.endpoints.get_mut(&token) {
            Some(Endpoint::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.endpoints.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.endpoints.keys().copied().collect()
    }

    /// Replaces the interest of a stream, re-registering only on change.
    pub fn set_interest(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let Some(Endpoint::Stream(stream)) = self.endpoints.get_mut(&token) else {
            return Ok(());
        };
        if stream.interest == interest {
            return Ok(());
        }
        self.handle
            .reregister(&mut stream.socket, token, interest)?;
        stream.interest = interest;
        Ok(())
    }

    /// Merges write interest into whatever the stream already waits for.
    pub fn arm_write(&mut self, token: Token) -> io::Result<()> {
        let Some(stream) = self.stream(token) else {
            return Ok(());
        };
        let interest = stream.interest() | Interest::WRITABLE;
        self.set_interest(token, interest)
    }

    /// Deregisters and drops the endpoint's socket. Closing an unknown token
    /// is a no-op and returns `false`.
    pub fn close(&mut self, token: Token) -> bool {
        let Some(endpoint) = self.endpoints.remove(&token) else {
            return false;
        };
        match endpoint {
            Endpoint::Listener(mut listening) => {
                if let Err(e) = self.handle.deregister(&mut listening.listener) {
                    tracing::error!("failed to deregister listener {token:?}: {e}");
                }
                tracing::info!("Close listener {token:?}");
            }
            Endpoint::Stream(mut stream) => {
                if let Err(e) = self.handle.deregister(&mut stream.socket) {
                    tracing::error!("failed to deregister {token:?}: {e}");
                }
                tracing::info!(
                    read = stream.bytes_read,
                    written = stream.bytes_written,
                    discarded = stream.queue.len(),
                    "Close {} connection {token:?}",
                    stream.side
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    fn connected_pair() -> (TcpStream, TcpStream, std::net::TcpListener) {
        let upstream = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(upstream.local_addr().unwrap()).unwrap();
        let (accepted, _) = upstream.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        accepted.set_nonblocking(true).unwrap();
        (
            TcpStream::from_std(accepted),
            TcpStream::from_std(client),
            upstream,
        )
    }

    #[test]
    fn tunnel_sides_point_at_each_other() {
        let poll = Poll::new().unwrap();
        let mut registry = Registry::new(poll.registry().try_clone().unwrap(), 1);
        let (local, remote, _upstream) = connected_pair();

        let tunnel = registry.add_tunnel(local, remote).unwrap();
        assert_eq!(tunnel.local, Token(1));
        assert_eq!(tunnel.remote, Token(2));

        let local = registry.stream(tunnel.local).unwrap();
        let remote = registry.stream(tunnel.remote).unwrap();
        assert_eq!(local.peer, tunnel.remote);
        assert_eq!(remote.peer, tunnel.local);
        assert_eq!(local.side, Side::Local);
        assert!(!local.connecting);
        assert!(remote.connecting);
        assert_eq!(local.interest(), Interest::READABLE);
        assert_eq!(remote.interest(), Interest::WRITABLE);
        assert!(local.queue.is_empty() && remote.queue.is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let poll = Poll::new().unwrap();
        let mut registry = Registry::new(poll.registry().try_clone().unwrap(), 1);
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = registry.add_listener(listener, 0).unwrap();
        assert!(registry.stream(token).is_none());
        assert!(registry.contains(token));

        assert!(registry.close(token));
        assert!(!registry.close(token));
        assert!(registry.is_empty());
    }

    #[test]
    fn tokens_are_never_reused() {
        let poll = Poll::new().unwrap();
        let mut registry = Registry::new(poll.registry().try_clone().unwrap(), 5);
        let first = registry
            .add_listener(TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap(), 0)
            .unwrap();
        registry.close(first);
        let second = registry
            .add_listener(TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap(), 0)
            .unwrap();
        assert_eq!(first, Token(5));
        assert_eq!(second, Token(6));
    }

    #[test]
    fn arm_write_merges_interest() {
        let poll = Poll::new().unwrap();
        let mut registry = Registry::new(poll.registry().try_clone().unwrap(), 1);
        let (local, remote, _upstream) = connected_pair();
        let tunnel = registry.add_tunnel(local, remote).unwrap();

        registry.arm_write(tunnel.local).unwrap();
        assert_eq!(
            registry.stream(tunnel.local).unwrap().interest(),
            Interest::READABLE | Interest::WRITABLE
        );

        registry.set_interest(tunnel.local, Interest::READABLE).unwrap();
        assert_eq!(registry.stream(tunnel.local).unwrap().interest(), Interest::READABLE);

        assert!(registry.close(tunnel.local));
        assert!(registry.stream(tunnel.remote).is_some());
        assert_eq!(registry.len(), 1);
    }
}
