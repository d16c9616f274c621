//! # TCP Transport
//!
//! `TcpFrameSink` is the publisher socket: it listens, picks up newly
//! connected subscribers whenever it sends, and fans each frame out to all of
//! them. `TcpFrameSource` is the subscriber socket.
//!
//! Each frame is serialized into one buffer and written with a single
//! `write_all`, so a subscriber sees the frame whole or the peer is dropped.
//! Subscribers never write, so a readable peer socket means it hung up; such
//! peers are pruned before every fan-out instead of swallowing a frame into
//! the kernel buffer.
//! On the reading side partial input stays buffered across receive timeouts.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::errors::{RelayError, RelayResult};
use crate::transport::wire::{decode_frame, encode_frame};
use crate::transport::{normalize_address, Frame, FrameSink, FrameSource};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Peer {
    addr: SocketAddr,
    stream: TcpStream,
}

/// Publisher socket fanning frames out to every connected subscriber.
pub struct TcpFrameSink {
    listener: TcpListener,
    local_addr: SocketAddr,
    peers: Mutex<Vec<Peer>>,
    closed: AtomicBool,
}

impl TcpFrameSink {
    /// Binds the publisher socket. Accepts `tcp://host:port` or `host:port`.
    pub fn bind(address: &str) -> RelayResult<Self> {
        let address = normalize_address(address);
        let listener = TcpListener::bind(address)
            .map_err(|e| RelayError::Transport(format!("failed to bind {}: {}", address, e)))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, "Publisher socket bound");
        Ok(Self {
            listener,
            local_addr,
            peers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribers currently attached, after picking up pending ones and
    /// pruning the ones that hung up.
    pub fn peer_count(&self) -> usize {
        let mut peers = lock(&self.peers);
        self.accept_pending(&mut peers);
        prune_hung_up(&mut peers);
        peers.len()
    }

    fn accept_pending(&self, peers: &mut Vec<Peer>) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let configured = stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_nodelay(true))
                        .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)));
                    match configured {
                        Ok(()) => {
                            tracing::info!(peer = %addr, "Subscriber connected");
                            peers.push(Peer { addr, stream });
                        }
                        Err(e) => tracing::warn!(peer = %addr, "Rejecting subscriber: {}", e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

fn has_hung_up(peer: &Peer) -> bool {
    if peer.stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut byte = [0u8; 1];
    let closed = match peer.stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
    };
    peer.stream.set_nonblocking(false).is_err() || closed
}

fn prune_hung_up(peers: &mut Vec<Peer>) {
    peers.retain(|peer| {
        if has_hung_up(peer) {
            tracing::info!(peer = %peer.addr, "Subscriber disconnected");
            let _ = peer.stream.shutdown(Shutdown::Both);
            false
        } else {
            true
        }
    });
}

impl FrameSink for TcpFrameSink {
    fn send(&self, frame: &Frame) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let bytes = encode_frame(frame)?;

        let mut peers = lock(&self.peers);
        self.accept_pending(&mut peers);
        prune_hung_up(&mut peers);
        if peers.is_empty() {
            return Err(RelayError::Transport("no subscriber connected".to_string()));
        }

        let mut delivered = 0usize;
        peers.retain_mut(|peer| match peer.stream.write_all(&bytes) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer.addr, "Dropping subscriber after failed write: {}", e);
                let _ = peer.stream.shutdown(Shutdown::Both);
                false
            }
        });

        if delivered == 0 {
            return Err(RelayError::Transport(format!("{} frame reached no subscriber", frame.tag)));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut peers = lock(&self.peers);
        for peer in peers.drain(..) {
            let _ = peer.stream.shutdown(Shutdown::Both);
        }
        tracing::info!(address = %self.local_addr, "Publisher socket closed");
    }
}

struct Connection {
    stream: TcpStream,
    buf: Vec<u8>,
}

/// Subscriber socket.
///
/// `recv` connects lazily when no connection is held. `connect` on a live
/// connection is a no-op, so it only helps after the publisher has gone away
/// and the connection was dropped on EOF or error.
pub struct TcpFrameSource {
    address: String,
    conn: Mutex<Option<Connection>>,
    // Clone of the live stream, reachable by `close` while `recv` holds `conn`.
    shutdown_handle: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl TcpFrameSource {
    /// Creates an unconnected source for `address` (`tcp://` prefix allowed).
    pub fn new(address: &str) -> Self {
        Self {
            address: normalize_address(address).to_string(),
            conn: Mutex::new(None),
            shutdown_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The publisher address this source dials.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        lock(&self.conn).is_some()
    }

    fn establish(&self, slot: &mut Option<Connection>) -> RelayResult<()> {
        let addrs: Vec<SocketAddr> = self
            .address
            .to_socket_addrs()
            .map_err(|e| RelayError::Transport(format!("cannot resolve {}: {}", self.address, e)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    *lock(&self.shutdown_handle) = Some(stream.try_clone()?);
                    *slot = Some(Connection {
                        stream,
                        buf: Vec::new(),
                    });
                    tracing::info!(address = %addr, "Connected to publisher");
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(RelayError::Transport(match last_err {
            Some(e) => format!("connect to {} failed: {}", self.address, e),
            None => format!("{} resolved to no address", self.address),
        }))
    }

    fn drop_connection(&self, slot: &mut Option<Connection>) {
        *slot = None;
        *lock(&self.shutdown_handle) = None;
    }
}

impl FrameSource for TcpFrameSource {
    fn recv(&self, timeout: Duration) -> RelayResult<Option<Frame>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.conn);
        if slot.is_none() {
            self.establish(&mut slot)?;
        }

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let Some(conn) = slot.as_mut() else {
                return Err(RelayError::Transport("not connected".to_string()));
            };
            match decode_frame(&mut conn.buf) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Corrupt frame stream from {}; dropping connection", self.address);
                    self.drop_connection(&mut slot);
                    return Err(e);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            conn.stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    self.drop_connection(&mut slot);
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(RelayError::Closed);
                    }
                    return Err(RelayError::Transport("publisher closed the connection".to_string()));
                }
                Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.drop_connection(&mut slot);
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(RelayError::Closed);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    fn connect(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let mut slot = lock(&self.conn);
        if slot.is_some() {
            tracing::info!(address = %self.address, "Connection already held; reconnect is a no-op");
            return Ok(());
        }
        self.establish(&mut slot)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stream) = lock(&self.shutdown_handle).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
