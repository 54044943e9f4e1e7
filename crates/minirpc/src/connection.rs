//! Per-peer connection state.
//!
//! A [`Connection`] is a cheap, clonable handle. Clones are shared between
//! application threads (which issue calls) and the dispatch thread that owns
//! the socket. The lifecycle is:
//!
//! ```text
//! CONNECTING --connect/bind ok--> CONNECTED --close/fatal error--> CLOSING --io drained--> CLOSED
//!      |                                                                                    ^
//!      +------------------------------- connect failed -------------------------------------+
//! ```
//!
//! On entry to CLOSED every pending call fails with
//! [`MinirpcError::Disconnected`], queued outbound frames are dropped and the
//! set's disconnect callback runs exactly once.
//!
//! Outbound frames wait in a bounded queue of
//! [`SetConfig::max_queued_frames`] entries. Application threads never block
//! on it: a full queue fails the send with [`MinirpcError::QueueFull`].

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use bytes::Bytes;
use minirpc_common::{MinirpcError, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SetConfig;
use crate::descriptor::Protocol;
use crate::dispatch;
use crate::pending::PendingTable;
use crate::set::SetInner;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Why a connection reached CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Closed locally through [`Connection::close`] or set shutdown.
    User,
    /// The peer closed the stream.
    Closed,
    /// A socket read or write failed.
    IoError,
    /// The peer violated the framing protocol, for example by announcing a
    /// payload above the maximum.
    ProtocolError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::User => write!(f, "closed locally"),
            DisconnectReason::Closed => write!(f, "closed by peer"),
            DisconnectReason::IoError => write!(f, "I/O error"),
            DisconnectReason::ProtocolError => write!(f, "protocol error"),
        }
    }
}

struct StateCell {
    state: ConnectionState,
    /// Set once a connect or bind has claimed this connection.
    claimed: bool,
    outbound: Option<mpsc::Sender<Bytes>>,
    /// Stops both I/O tasks at once, dropping unwritten frames.
    token: Option<CancellationToken>,
    /// Asks the writer to flush the queue and shut the socket down.
    draining: Option<CancellationToken>,
    reason: Option<DisconnectReason>,
    peer: Option<String>,
}

pub(crate) struct ConnectionInner<C> {
    id: u64,
    set: Arc<SetInner<C>>,
    context: C,
    state: Mutex<StateCell>,
    pending: PendingTable,
    /// True while inbound requests are delivered to handlers.
    events: watch::Sender<bool>,
}

/// Handle to one peer session.
pub struct Connection<C> {
    inner: Arc<ConnectionInner<C>>,
}

impl<C> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &cell.state)
            .field("peer", &cell.peer)
            .finish()
    }
}

impl<C> Connection<C> {
    pub(crate) fn new(id: u64, set: Arc<SetInner<C>>, context: C) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                set,
                context,
                state: Mutex::new(StateCell {
                    state: ConnectionState::Connecting,
                    claimed: false,
                    outbound: None,
                    token: None,
                    draining: None,
                    reason: None,
                    peer: None,
                }),
                pending: PendingTable::new(),
                events: watch::channel(true).0,
            }),
        }
    }

    /// Identifier unique within the connection set.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The per-connection application context.
    pub fn context(&self) -> &C {
        &self.inner.context
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Why the connection closed, once it is CLOSING or CLOSED.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.inner.state.lock().reason
    }

    /// Address of the peer, if the socket reported one.
    pub fn peer_addr(&self) -> Option<String> {
        self.inner.state.lock().peer.clone()
    }

    /// Number of two-way calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    pub(crate) fn protocol(&self) -> &Protocol<C> {
        self.inner.set.protocol()
    }

    pub(crate) fn config(&self) -> &SetConfig {
        self.inner.set.config()
    }

    /// Suspends delivery of inbound requests to handlers.
    ///
    /// The request being handled when this is called (if any) runs to
    /// completion. The next request is held, and the connection stops
    /// reading, until [`start_events`](Connection::start_events). Replies
    /// that arrive ahead of the held request are still matched to their
    /// calls; replies behind it wait with it.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::NotConnected`] unless the connection is CONNECTED
    /// - [`MinirpcError::InvalidArgument`] if events are already stopped
    pub fn stop_events(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(MinirpcError::NotConnected);
        }
        let changed = self.inner.events.send_if_modified(|running| std::mem::replace(running, false));
        if !changed {
            return Err(MinirpcError::InvalidArgument("events are already stopped".to_string()));
        }
        debug!(conn = self.inner.id, "events stopped");
        Ok(())
    }

    /// Resumes delivery of inbound requests.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::NotConnected`] unless the connection is CONNECTED
    /// - [`MinirpcError::InvalidArgument`] if events are not stopped
    pub fn start_events(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(MinirpcError::NotConnected);
        }
        let changed = self.inner.events.send_if_modified(|running| !std::mem::replace(running, true));
        if !changed {
            return Err(MinirpcError::InvalidArgument("events are not stopped".to_string()));
        }
        debug!(conn = self.inner.id, "events started");
        Ok(())
    }

    pub fn events_stopped(&self) -> bool {
        !*self.inner.events.borrow()
    }

    pub(crate) fn events(&self) -> watch::Receiver<bool> {
        self.inner.events.subscribe()
    }

    /// Starts closing the connection.
    ///
    /// Frames queued before the call are still written; the socket is shut
    /// down afterwards and the connection moves to CLOSED on a dispatch
    /// thread. Calls still waiting for replies then fail with
    /// [`MinirpcError::Disconnected`].
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::NotConnected`] if the connection never connected
    /// - [`MinirpcError::InvalidArgument`] if it is already closing or closed
    pub fn close(&self) -> Result<()> {
        let mut cell = self.inner.state.lock();
        match cell.state {
            ConnectionState::Connecting => Err(MinirpcError::NotConnected),
            ConnectionState::Closed if cell.reason.is_none() => Err(MinirpcError::NotConnected),
            ConnectionState::Closing | ConnectionState::Closed => Err(MinirpcError::InvalidArgument(
                "connection already closing".to_string(),
            )),
            ConnectionState::Connected => {
                cell.state = ConnectionState::Closing;
                cell.reason.get_or_insert(DisconnectReason::User);
                match (&cell.draining, &cell.token) {
                    (Some(draining), _) => draining.cancel(),
                    (None, Some(token)) => token.cancel(),
                    (None, None) => {}
                }
                debug!(conn = self.inner.id, "closing connection");
                Ok(())
            }
        }
    }

    /// Hands an encoded frame to the writer without waiting for room.
    pub(crate) fn enqueue(&self, frame: Bytes) -> Result<()> {
        let cell = self.inner.state.lock();
        if cell.state != ConnectionState::Connected {
            return Err(MinirpcError::NotConnected);
        }
        let tx = cell.outbound.as_ref().ok_or(MinirpcError::NotConnected)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MinirpcError::QueueFull(self.config().max_queued_frames)
            }
            mpsc::error::TrySendError::Closed(_) => MinirpcError::Disconnected,
        })
    }

    /// The outbound queue, while the connection is CONNECTED. The reader
    /// uses it to wait for room instead of failing on a full queue.
    pub(crate) fn outbound(&self) -> Option<mpsc::Sender<Bytes>> {
        let cell = self.inner.state.lock();
        if cell.state != ConnectionState::Connected {
            return None;
        }
        cell.outbound.clone()
    }

    /// Moves a live connection to CLOSING and stops its I/O without
    /// flushing.
    pub(crate) fn fail(&self, reason: DisconnectReason) {
        let mut cell = self.inner.state.lock();
        if !matches!(cell.state, ConnectionState::Connected | ConnectionState::Closing) {
            return;
        }
        cell.state = ConnectionState::Closing;
        cell.reason.get_or_insert(reason);
        if let Some(token) = &cell.token {
            token.cancel();
        }
    }

    /// Enters CLOSED. Runs at most once per connection.
    pub(crate) fn finish(&self, reason: DisconnectReason) {
        let reason = {
            let mut cell = self.inner.state.lock();
            if cell.state == ConnectionState::Closed {
                return;
            }
            cell.state = ConnectionState::Closed;
            cell.outbound = None;
            cell.token = None;
            cell.draining = None;
            *cell.reason.get_or_insert(reason)
        };

        let failed = self.inner.pending.drain();
        info!(conn = self.inner.id, %reason, failed_calls = failed, "connection closed");

        self.inner.set.notify_disconnect(self, reason);
        self.inner.set.untrack(self.inner.id);
    }

    /// Reports a non-fatal protocol problem.
    pub(crate) fn report_ioerr(&self, message: String) {
        warn!(conn = self.inner.id, "{}", message);
        self.inner.set.notify_ioerr(self, &message);
    }

    /// Gives up on a connection that never reached CONNECTED.
    fn abandon(&self) {
        let mut cell = self.inner.state.lock();
        cell.state = ConnectionState::Closed;
        drop(cell);
        self.inner.pending.drain();
    }

    fn claim(&self) -> Result<()> {
        let mut cell = self.inner.state.lock();
        if cell.state != ConnectionState::Connecting || cell.claimed {
            return Err(MinirpcError::InvalidArgument(
                "connection is already connected or connecting".to_string(),
            ));
        }
        cell.claimed = true;
        Ok(())
    }
}

impl<C: Send + Sync + 'static> Connection<C> {
    /// Connects to `addr` over TCP, blocking the calling thread.
    ///
    /// Each resolved address is tried in turn with the set's
    /// `connect_timeout`.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::ConnectFailed`] if no address accepted the
    ///   connection; the connection is then CLOSED
    /// - [`MinirpcError::InvalidArgument`] if the connection was already used
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        self.claim()?;

        let stream = match self.open_tcp(addr) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(conn = self.inner.id, error = %e, "connect failed");
                self.abandon();
                return Err(e);
            }
        };
        self.adopt_tcp(stream)
    }

    /// Adopts an already connected TCP stream, for example one accepted by
    /// the application itself.
    pub fn bind_tcp(&self, stream: TcpStream) -> Result<()> {
        self.claim()?;
        self.adopt_tcp(stream)
    }

    /// Connects to a Unix domain socket at `path`.
    #[cfg(unix)]
    pub fn connect_unix<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.claim()?;
        let path = path.as_ref();
        let stream = match std::os::unix::net::UnixStream::connect(path) {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon();
                return Err(MinirpcError::ConnectFailed(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
            }
        };
        self.adopt_unix(stream, Some(path.display().to_string()))
    }

    /// Adopts an already connected Unix domain stream.
    #[cfg(unix)]
    pub fn bind_unix(&self, stream: std::os::unix::net::UnixStream) -> Result<()> {
        self.claim()?;
        self.adopt_unix(stream, None)
    }

    fn open_tcp<A: ToSocketAddrs>(&self, addr: A) -> Result<TcpStream> {
        let addrs = addr
            .to_socket_addrs()
            .map_err(|e| MinirpcError::ConnectFailed(format!("invalid address: {}", e)))?;

        let timeout = self.config().connect_timeout;
        let mut last_err = None;
        for socket_addr in addrs {
            match TcpStream::connect_timeout(&socket_addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(conn = self.inner.id, addr = %socket_addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(MinirpcError::ConnectFailed(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "address resolved to nothing".to_string()),
        ))
    }

    fn adopt_tcp(&self, stream: TcpStream) -> Result<()> {
        let prepared = self
            .config()
            .apply_to(&stream)
            .and_then(|_| stream.set_nonblocking(true));
        if let Err(e) = prepared {
            self.abandon();
            return Err(e.into());
        }
        let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
        self.start_io(move || tokio::net::TcpStream::from_std(stream), peer)
    }

    #[cfg(unix)]
    fn adopt_unix(&self, stream: std::os::unix::net::UnixStream, peer: Option<String>) -> Result<()> {
        if let Err(e) = stream.set_nonblocking(true) {
            self.abandon();
            return Err(e.into());
        }
        self.start_io(move || tokio::net::UnixStream::from_std(stream), peer)
    }

    /// Marks the connection CONNECTED and hands its socket to a dispatch
    /// thread. `open` runs on that thread so the socket registers with the
    /// right reactor.
    fn start_io<S, F>(&self, open: F, peer: Option<String>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce() -> io::Result<S> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config().max_queued_frames);
        let token = CancellationToken::new();
        let draining = CancellationToken::new();
        {
            let mut cell = self.inner.state.lock();
            cell.state = ConnectionState::Connected;
            cell.outbound = Some(tx);
            cell.token = Some(token.clone());
            cell.draining = Some(draining.clone());
            cell.peer = peer.clone();
        }

        if !self.inner.set.track(self) {
            self.finish(DisconnectReason::User);
            return Err(MinirpcError::InvalidArgument(
                "connection set is shut down".to_string(),
            ));
        }

        info!(conn = self.inner.id, peer = peer.as_deref().unwrap_or("-"), "connection established");
        let task = dispatch::connection_task(self.clone(), open, rx, token, draining);
        self.inner.set.dispatch().spawn(task);
        Ok(())
    }
}
