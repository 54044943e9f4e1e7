//! Connection sets.
//!
//! A [`ConnectionSet`] binds a group of connections to one [`Protocol`],
//! owns the dispatch threads that serve them, and carries the callbacks the
//! application registers for disconnects and protocol errors.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use minirpc_common::{MinirpcError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SetConfig;
use crate::connection::{Connection, DisconnectReason};
use crate::descriptor::Protocol;
use crate::dispatch::DispatchPool;

/// Pause after an accept error that would fail again straight away, such
/// as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type DisconnectFn<C> = Arc<dyn Fn(&Connection<C>, DisconnectReason) + Send + Sync>;
type IoErrFn<C> = Arc<dyn Fn(&Connection<C>, &str) + Send + Sync>;

pub(crate) struct SetInner<C> {
    protocol: Arc<Protocol<C>>,
    context: C,
    config: SetConfig,
    dispatch: DispatchPool,
    connections: Mutex<HashMap<u64, Connection<C>>>,
    drained: Condvar,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    listeners: Mutex<CancellationToken>,
    on_disconnect: RwLock<Option<DisconnectFn<C>>>,
    on_ioerr: RwLock<Option<IoErrFn<C>>>,
}

impl<C> SetInner<C> {
    pub(crate) fn protocol(&self) -> &Protocol<C> {
        &self.protocol
    }

    pub(crate) fn config(&self) -> &SetConfig {
        &self.config
    }

    pub(crate) fn dispatch(&self) -> &DispatchPool {
        &self.dispatch
    }

    /// Records a connection that just became CONNECTED. Returns false once
    /// the set is shutting down.
    pub(crate) fn track(&self, conn: &Connection<C>) -> bool {
        let mut connections = self.connections.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        connections.insert(conn.id(), conn.clone());
        true
    }

    pub(crate) fn untrack(&self, id: u64) {
        let mut connections = self.connections.lock();
        connections.remove(&id);
        if connections.is_empty() {
            self.drained.notify_all();
        }
    }

    pub(crate) fn notify_disconnect(&self, conn: &Connection<C>, reason: DisconnectReason) {
        let callback = self.on_disconnect.read().clone();
        if let Some(callback) = callback {
            callback(conn, reason);
        }
    }

    pub(crate) fn notify_ioerr(&self, conn: &Connection<C>, message: &str) {
        let callback = self.on_ioerr.read().clone();
        if let Some(callback) = callback {
            callback(conn, message);
        }
    }
}

impl<C> Drop for SetInner<C> {
    fn drop(&mut self) {
        self.listeners.get_mut().cancel();
        self.dispatch.stop(false);
    }
}

/// Shared owner of a group of connections and their dispatch threads.
///
/// `C` is the application context type. The set keeps a default context and
/// every connection carries its own.
///
/// # Example
///
/// ```no_run
/// use minirpc::{ConnectionSet, Protocol};
///
/// let protocol = Protocol::<String>::builder("echo")
///     .handles(1, |conn, text: String| Ok(format!("{}: {}", conn.context(), text)))
///     .build()?;
///
/// let set = ConnectionSet::create(protocol, "server".to_string());
/// set.start_dispatch(2)?;
/// let addr = set.listen("127.0.0.1:0", |peer| peer.to_string())?;
/// println!("listening on {}", addr);
/// # Ok::<(), minirpc::MinirpcError>(())
/// ```
pub struct ConnectionSet<C> {
    inner: Arc<SetInner<C>>,
}

impl<C> Clone for ConnectionSet<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> ConnectionSet<C> {
    /// Creates a set with the default [`SetConfig`]. No dispatch threads run
    /// until [`start_dispatch`](ConnectionSet::start_dispatch).
    pub fn create(protocol: Arc<Protocol<C>>, context: C) -> Self {
        Self::build(protocol, context, SetConfig::default())
    }

    /// Creates a set with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MinirpcError::InvalidArgument`] if `config` is invalid.
    pub fn with_config(protocol: Arc<Protocol<C>>, context: C, config: SetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(protocol, context, config))
    }

    fn build(protocol: Arc<Protocol<C>>, context: C, config: SetConfig) -> Self {
        debug!(protocol = protocol.name(), "creating connection set");
        let dispatch = DispatchPool::new(protocol.name().to_string());
        Self {
            inner: Arc::new(SetInner {
                protocol,
                context,
                config,
                dispatch,
                connections: Mutex::new(HashMap::new()),
                drained: Condvar::new(),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                listeners: Mutex::new(CancellationToken::new()),
                on_disconnect: RwLock::new(None),
                on_ioerr: RwLock::new(None),
            }),
        }
    }

    /// Starts `threads` more dispatch threads. Connections bound before any
    /// thread was running are handed out now.
    pub fn start_dispatch(&self, threads: usize) -> Result<()> {
        self.inner.dispatch.start(threads)
    }

    /// Dispatches events on the calling thread until the set shuts down.
    ///
    /// The thread joins the set's dispatch threads: it serves connections
    /// alongside any started with
    /// [`start_dispatch`](ConnectionSet::start_dispatch), and connections
    /// bound before any thread was running are handed to it. It must not be
    /// called from a handler or callback.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::InvalidArgument`] if the set is shut down or the
    ///   thread already dispatches for this set
    /// - [`MinirpcError::Io`] if the thread's runtime cannot be built
    pub fn dispatch_loop(&self) -> Result<()> {
        self.inner.dispatch.run_here()
    }

    pub fn dispatch_threads(&self) -> usize {
        self.inner.dispatch.thread_count()
    }

    /// Creates an unconnected connection carrying `context`.
    pub fn create_connection(&self, context: C) -> Connection<C> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Connection::new(id, self.inner.clone(), context)
    }

    /// Creates a connection carrying a clone of the set's default context.
    pub fn create_connection_default(&self) -> Connection<C>
    where
        C: Clone,
    {
        self.create_connection(self.inner.context.clone())
    }

    /// Creates a connection and connects it to `addr`.
    pub fn connect<A: ToSocketAddrs>(&self, addr: A, context: C) -> Result<Connection<C>> {
        let conn = self.create_connection(context);
        conn.connect(addr)?;
        Ok(conn)
    }

    /// Listens for TCP connections on `addr`.
    ///
    /// Each accepted socket becomes a connection whose context is produced by
    /// `accept` from the peer address. The accept loop runs on a dispatch
    /// thread until [`close_listeners`](ConnectionSet::close_listeners) or
    /// [`shutdown`](ConnectionSet::shutdown).
    ///
    /// # Returns
    ///
    /// The bound local address, useful when binding port 0.
    pub fn listen<A, F>(&self, addr: A, accept: F) -> Result<SocketAddr>
    where
        A: ToSocketAddrs,
        F: Fn(SocketAddr) -> C + Send + Sync + 'static,
    {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(MinirpcError::InvalidArgument(
                "connection set is shut down".to_string(),
            ));
        }

        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let token = self.inner.listeners.lock().clone();
        let set = Arc::downgrade(&self.inner);

        info!(addr = %local, protocol = self.inner.protocol.name(), "listening");
        self.inner
            .dispatch
            .spawn(Box::pin(accept_loop(set, listener, accept, token)));
        Ok(local)
    }

    /// Like [`listen`](ConnectionSet::listen), giving every accepted
    /// connection a clone of the set's default context.
    pub fn listen_default<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr>
    where
        C: Clone,
    {
        let context = self.inner.context.clone();
        self.listen(addr, move |_peer| context.clone())
    }

    /// Stops every listener started so far. Established connections are not
    /// affected.
    pub fn close_listeners(&self) {
        let mut token = self.inner.listeners.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Registers the callback run when a connection reaches CLOSED.
    ///
    /// It runs once per connection that became CONNECTED, after its pending
    /// calls have been failed, usually on a dispatch thread.
    pub fn set_disconnect_fn<F>(&self, callback: F)
    where
        F: Fn(&Connection<C>, DisconnectReason) + Send + Sync + 'static,
    {
        *self.inner.on_disconnect.write() = Some(Arc::new(callback));
    }

    /// Registers the callback run for non-fatal protocol errors: requests for
    /// unknown commands, malformed payloads and unmatched replies.
    pub fn set_ioerr_fn<F>(&self, callback: F)
    where
        F: Fn(&Connection<C>, &str) + Send + Sync + 'static,
    {
        *self.inner.on_ioerr.write() = Some(Arc::new(callback));
    }

    /// The set's default context.
    pub fn context(&self) -> &C {
        &self.inner.context
    }

    pub fn protocol(&self) -> &Arc<Protocol<C>> {
        &self.inner.protocol
    }

    pub fn config(&self) -> &SetConfig {
        &self.inner.config
    }

    /// Connections currently CONNECTED or CLOSING.
    pub fn connections(&self) -> Vec<Connection<C>> {
        self.inner.connections.lock().values().cloned().collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Shuts the set down.
    ///
    /// Listeners stop, every live connection is closed and given
    /// `shutdown_timeout` to flush before it is forced closed, then the
    /// dispatch threads are stopped and joined. Idempotent.
    ///
    /// Called from a dispatch thread (for example inside a callback) it
    /// cannot wait for connections served by that thread, so it only starts
    /// the close and stops the threads without joining the caller's own.
    pub fn shutdown(&self) {
        let live: Vec<Connection<C>> = {
            let connections = self.inner.connections.lock();
            if self.inner.shut_down.swap(true, Ordering::AcqRel) {
                return;
            }
            connections.values().cloned().collect()
        };

        info!(
            protocol = self.inner.protocol.name(),
            connections = live.len(),
            "shutting down connection set"
        );
        self.close_listeners();
        for conn in &live {
            let _ = conn.close();
        }
        drop(live);

        let dispatch = &self.inner.dispatch;
        if dispatch.thread_count() > 0 && !dispatch.is_worker_thread() {
            let timeout = self.inner.config.shutdown_timeout;
            if !self.wait_drained(timeout) {
                warn!("connections did not flush in time, forcing them closed");
                for conn in self.connections() {
                    conn.fail(DisconnectReason::User);
                }
                self.wait_drained(timeout);
            }
        }

        dispatch.stop(true);
    }

    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut connections = self.inner.connections.lock();
        while !connections.is_empty() {
            if self.inner.drained.wait_until(&mut connections, deadline).timed_out() {
                return connections.is_empty();
            }
        }
        true
    }
}

async fn accept_loop<C, F>(
    set: Weak<SetInner<C>>,
    listener: std::net::TcpListener,
    accept: F,
    token: CancellationToken,
) where
    C: Send + Sync + 'static,
    F: Fn(SocketAddr) -> C + Send + Sync + 'static,
{
    let local = listener.local_addr().ok();
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, "failed to register listener");
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if !recover_from_accept_error(&e, &token).await {
                    break;
                }
                continue;
            }
        };
        let Some(inner) = set.upgrade() else { break };
        let owner = ConnectionSet { inner };

        debug!(%peer, "accepted connection");
        let conn = owner.create_connection(accept(peer));
        let bound = stream
            .into_std()
            .map_err(MinirpcError::from)
            .and_then(|stream| conn.bind_tcp(stream));
        if let Err(e) = bound {
            warn!(%peer, error = %e, "failed to set up accepted connection");
        }
    }

    debug!(addr = ?local, "listener stopped");
}

/// How long to wait before accepting again after `error`. Errors that only
/// concern the one connection being accepted are retried at once.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Waits out an accept error. Returns false if the listener was closed
/// meanwhile.
async fn recover_from_accept_error(error: &io::Error, token: &CancellationToken) -> bool {
    let Some(delay) = accept_backoff(error) else {
        debug!(error = %error, "accept interrupted, retrying");
        return true;
    };
    warn!(error = %error, retry_ms = delay.as_millis() as u64, "accept failed, backing off");
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
