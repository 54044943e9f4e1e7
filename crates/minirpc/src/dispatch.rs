//! Dispatch threads.
//!
//! A [`DispatchPool`] is a fixed set of OS threads, each driving its own
//! single-threaded tokio runtime. Every connection is pinned to one worker
//! for its whole life, so exactly one thread ever decodes its frames. A
//! connection runs as two tasks on its worker:
//!
//! - the **reader** pulls bytes into the frame decoder and processes one
//!   frame at a time, yielding to the other connections on the same worker
//!   after each frame
//! - the **writer** drains the connection's outbound queue; partial writes
//!   park the task until the socket is writable again
//!
//! Request handlers run inline on the reader task. A thread may also join
//! the pool for as long as it likes through [`DispatchPool::run_here`].

use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use bytes::{Bytes, BytesMut};
use minirpc_common::{Frame, FrameCodec, FrameFlags, FrameHeader, FrameKind, MinirpcError, Result, Status};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, DisconnectReason};
use crate::descriptor::Handled;
use crate::pending::Resolution;
use crate::reply::{error_reply, reply_frame};

pub(crate) type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum WorkerCommand {
    Spawn(Task),
    Shutdown,
}

struct Worker {
    sender: mpsc::UnboundedSender<WorkerCommand>,
    load: Arc<AtomicUsize>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(pool: &str, index: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name(format!("{}-dispatch-{}", pool, index))
            .spawn(move || run_worker(index, receiver))?;
        Ok(Self {
            sender,
            load: Arc::new(AtomicUsize::new(0)),
            thread_id: handle.thread().id(),
            handle: Some(handle),
        })
    }
}

fn build_runtime() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn run_worker(index: usize, receiver: mpsc::UnboundedReceiver<WorkerCommand>) {
    match build_runtime() {
        Ok(runtime) => drive(index, runtime, receiver),
        Err(e) => error!(worker = index, error = %e, "failed to build dispatch runtime"),
    }
}

/// Runs a worker's tasks on the current thread until it is told to stop.
fn drive(index: usize, runtime: Runtime, mut receiver: mpsc::UnboundedReceiver<WorkerCommand>) {
    debug!(worker = index, "dispatch thread started");
    runtime.block_on(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                WorkerCommand::Spawn(task) => {
                    tokio::spawn(task);
                }
                WorkerCommand::Shutdown => break,
            }
        }
    });
    // Dropping the runtime drops any task still running on it.
    drop(runtime);
    debug!(worker = index, "dispatch thread stopped");
}

/// Decrements a worker's load when the task holding it ends.
struct LoadSlot(Arc<AtomicUsize>);

impl Drop for LoadSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The dispatch threads of one connection set.
///
/// Tasks spawned before any thread is started wait in a backlog and are
/// handed out by [`start`](DispatchPool::start).
pub(crate) struct DispatchPool {
    name: String,
    workers: RwLock<Vec<Worker>>,
    backlog: Mutex<Vec<Task>>,
    stopped: AtomicBool,
}

impl DispatchPool {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: RwLock::new(Vec::new()),
            backlog: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Adds `count` dispatch threads.
    pub(crate) fn start(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(MinirpcError::InvalidArgument(
                "dispatch thread count must be greater than zero".to_string(),
            ));
        }

        let rejected = {
            let mut backlog = self.backlog.lock();
            if self.stopped.load(Ordering::Acquire) {
                return Err(MinirpcError::InvalidArgument(
                    "connection set is shut down".to_string(),
                ));
            }
            let mut workers = self.workers.write();
            for _ in 0..count {
                let index = workers.len();
                workers.push(Worker::spawn(&self.name, index)?);
            }
            info!(pool = %self.name, added = count, total = workers.len(), "dispatch threads started");

            let mut rejected = Vec::new();
            for task in backlog.drain(..) {
                if let Some(task) = Self::assign(&workers, task) {
                    rejected.push(task);
                }
            }
            rejected
        };
        drop(rejected);
        Ok(())
    }

    /// Runs `task` on the least-loaded dispatch thread.
    pub(crate) fn spawn(&self, task: Task) {
        let rejected = {
            let mut backlog = self.backlog.lock();
            if self.stopped.load(Ordering::Acquire) {
                Some(task)
            } else {
                let workers = self.workers.read();
                if workers.is_empty() {
                    backlog.push(task);
                    None
                } else {
                    Self::assign(&workers, task)
                }
            }
        };
        // Dropped outside the locks; a connection task finishes its
        // connection when dropped, which runs application callbacks.
        if rejected.is_some() {
            warn!(pool = %self.name, "dispatch pool stopped, dropping task");
        }
        drop(rejected);
    }

    /// Hands `task` to a worker. Returns it if the worker is gone.
    fn assign(workers: &[Worker], task: Task) -> Option<Task> {
        let worker = workers.iter().min_by_key(|w| w.load.load(Ordering::Relaxed))?;
        worker.load.fetch_add(1, Ordering::Relaxed);
        let slot = LoadSlot(worker.load.clone());
        let tracked: Task = Box::pin(async move {
            let _slot = slot;
            task.await;
        });
        match worker.sender.send(WorkerCommand::Spawn(tracked)) {
            Ok(()) => None,
            Err(mpsc::error::SendError(WorkerCommand::Spawn(task))) => Some(task),
            Err(_) => None,
        }
    }

    /// Makes the calling thread a dispatch thread until the pool stops.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::InvalidArgument`] if the pool is stopped or the
    ///   calling thread already dispatches for it
    /// - [`MinirpcError::Io`] if the thread's runtime cannot be built
    pub(crate) fn run_here(&self) -> Result<()> {
        let current = thread::current().id();
        let runtime = build_runtime()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let (index, rejected) = {
            let mut backlog = self.backlog.lock();
            if self.stopped.load(Ordering::Acquire) {
                return Err(MinirpcError::InvalidArgument(
                    "connection set is shut down".to_string(),
                ));
            }
            let mut workers = self.workers.write();
            if workers.iter().any(|w| w.thread_id == current) {
                return Err(MinirpcError::InvalidArgument(
                    "this thread already dispatches for the connection set".to_string(),
                ));
            }
            let index = workers.len();
            workers.push(Worker {
                sender,
                load: Arc::new(AtomicUsize::new(0)),
                thread_id: current,
                handle: None,
            });

            let mut rejected = Vec::new();
            for task in backlog.drain(..) {
                if let Some(task) = Self::assign(&workers, task) {
                    rejected.push(task);
                }
            }
            (index, rejected)
        };
        drop(rejected);

        info!(pool = %self.name, worker = index, "dispatching on the calling thread");
        drive(index, runtime, receiver);
        Ok(())
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.workers.read().len()
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.workers.read().iter().any(|w| w.thread_id == current)
    }

    /// Stops every dispatch thread. With `join`, waits for them to exit
    /// (except the calling thread, if it is one of them).
    pub(crate) fn stop(&self, join: bool) {
        let (workers, backlog) = {
            let mut backlog = self.backlog.lock();
            self.stopped.store(true, Ordering::Release);
            let workers = std::mem::take(&mut *self.workers.write());
            (workers, std::mem::take(&mut *backlog))
        };
        drop(backlog);

        for worker in &workers {
            let _ = worker.sender.send(WorkerCommand::Shutdown);
        }
        if !join {
            return;
        }

        let current = thread::current().id();
        for mut worker in workers {
            if worker.thread_id == current {
                continue;
            }
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!(pool = %self.name, "dispatch thread panicked");
                }
            }
        }
    }
}

/// Finishes a connection on every exit path of its task, including the
/// task being dropped unpolled.
struct FinishGuard<C> {
    conn: Option<Connection<C>>,
}

impl<C> FinishGuard<C> {
    fn finish(mut self, reason: DisconnectReason) {
        if let Some(conn) = self.conn.take() {
            conn.finish(reason);
        }
    }
}

impl<C> Drop for FinishGuard<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.finish(DisconnectReason::User);
        }
    }
}

/// Builds the task that owns a connection's socket.
///
/// `token` stops both halves immediately. `draining` lets the writer flush
/// what is queued and shut the socket down first.
pub(crate) fn connection_task<C, S, F>(
    conn: Connection<C>,
    open: F,
    outbound: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    draining: CancellationToken,
) -> Task
where
    C: Send + Sync + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnOnce() -> std::io::Result<S> + Send + 'static,
{
    let guard = FinishGuard {
        conn: Some(conn.clone()),
    };
    Box::pin(async move {
        let stream = match open() {
            Ok(stream) => stream,
            Err(e) => {
                error!(conn = conn.id(), error = %e, "failed to register socket");
                guard.finish(DisconnectReason::IoError);
                return;
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let writer = tokio::spawn(write_frames(conn.clone(), writer, outbound, token.clone(), draining));

        let reason = read_frames(&conn, reader, &token).await;
        conn.fail(reason);
        token.cancel();
        if let Err(e) = writer.await {
            error!(conn = conn.id(), error = %e, "writer task failed");
        }

        guard.finish(reason);
    })
}

async fn read_frames<C, R>(conn: &Connection<C>, mut reader: R, token: &CancellationToken) -> DisconnectReason
where
    C: Send + Sync + 'static,
    R: AsyncRead + Unpin,
{
    let config = conn.config();
    let mut codec = FrameCodec::new(config.max_payload_len);
    let mut buf = BytesMut::with_capacity(config.read_buffer_size);
    let mut events = conn.events();

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                let is_request = matches!(frame.header.kind(), FrameKind::Request | FrameKind::OneWay);
                if is_request && !*events.borrow() {
                    debug!(conn = conn.id(), sequence = frame.header.sequence, "holding request until events start");
                    tokio::select! {
                        _ = token.cancelled() => return DisconnectReason::User,
                        resumed = events_resumed(&mut events) => {
                            if !resumed {
                                return DisconnectReason::User;
                            }
                        }
                    }
                }

                if let Some(reply) = handle_frame(conn, frame) {
                    if let Some(outbound) = conn.outbound() {
                        // a full queue parks the reader, so a peer that
                        // stops reading replies also stops being served
                        tokio::select! {
                            _ = token.cancelled() => return DisconnectReason::User,
                            sent = outbound.send(reply) => {
                                if sent.is_err() {
                                    debug!(conn = conn.id(), "dropping reply, writer is gone");
                                }
                            }
                        }
                    }
                }
                tokio::task::yield_now().await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(conn = conn.id(), error = %e, "fatal framing error, closing connection");
                return DisconnectReason::ProtocolError;
            }
        }

        tokio::select! {
            _ = token.cancelled() => return DisconnectReason::User,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(conn = conn.id(), partial = codec.is_mid_frame() || !buf.is_empty(), "peer closed connection");
                    return DisconnectReason::Closed;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(conn = conn.id(), error = %e, "read failed");
                    return DisconnectReason::IoError;
                }
            },
        }
    }
}

async fn events_resumed(events: &mut watch::Receiver<bool>) -> bool {
    events.wait_for(|running| *running).await.is_ok()
}

async fn write_frames<C, W>(
    conn: Connection<C>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    draining: CancellationToken,
) where
    C: Send + Sync + 'static,
    W: AsyncWrite + Unpin,
{
    let result: std::io::Result<()> = async {
        loop {
            // queued frames win over the close request so they are flushed
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                next = outbound.recv() => next,
                _ = draining.cancelled() => None,
            };
            let Some(bytes) = next else { break };
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                written = writer.write_all(&bytes) => written?,
            }
        }

        while let Ok(bytes) = outbound.try_recv() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                written = writer.write_all(&bytes) => written?,
            }
        }
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(conn = conn.id(), error = %e, "write failed");
        conn.fail(DisconnectReason::IoError);
    }
    token.cancel();
}

/// Processes one inbound frame. Returns the reply to send, if any.
fn handle_frame<C: Send + Sync + 'static>(conn: &Connection<C>, frame: Frame) -> Option<Bytes> {
    match frame.header.kind() {
        FrameKind::Request | FrameKind::OneWay => handle_request(conn, frame),
        FrameKind::Reply | FrameKind::ErrorReply => {
            handle_reply(conn, frame);
            None
        }
    }
}

fn handle_request<C: Send + Sync + 'static>(conn: &Connection<C>, frame: Frame) -> Option<Bytes> {
    let FrameHeader {
        command, sequence, ..
    } = frame.header;

    let outcome = if frame.header.flags.contains(FrameFlags::ERROR) {
        conn.report_ioerr(format!(
            "request {} for command {} carries the error flag",
            sequence, command
        ));
        Err(Status::MalformedPayload)
    } else {
        match conn.protocol().handled_command(command) {
            None => {
                conn.report_ioerr(format!("request for unknown command {}", command));
                Err(Status::UnknownCommand)
            }
            Some(entry) => {
                let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
                    entry.invoke(conn, &frame.header, &frame.payload)
                }));
                match invoked {
                    Ok(Err(Status::MalformedPayload)) => {
                        conn.report_ioerr(format!("malformed request payload for command {}", command));
                        Err(Status::MalformedPayload)
                    }
                    Ok(outcome) => outcome,
                    // the unwound reply handle has already answered
                    Err(_) if entry.is_deferred() => {
                        error!(conn = conn.id(), command, sequence, "deferred request handler panicked");
                        Ok(Handled::Deferred)
                    }
                    Err(_) => {
                        error!(conn = conn.id(), command, sequence, "request handler panicked");
                        Err(Status::HandlerFailed)
                    }
                }
            }
        }
    };

    if !frame.header.expects_reply() {
        if let Err(status) = outcome {
            debug!(conn = conn.id(), command, sequence, %status, "one-way request failed");
        }
        return None;
    }

    match outcome {
        Ok(Handled::Deferred) => None,
        Ok(Handled::Reply(payload)) => Some(
            reply_frame(conn, command, sequence, &payload)
                .unwrap_or_else(|_| error_reply(command, sequence, Status::FrameTooLarge)),
        ),
        Err(status) => Some(error_reply(command, sequence, status)),
    }
}

fn handle_reply<C: Send + Sync + 'static>(conn: &Connection<C>, frame: Frame) {
    let FrameHeader {
        command, sequence, ..
    } = frame.header;

    match conn.pending().resolve(sequence) {
        Resolution::Pending(entry) => {
            let outcome = if entry.command != command {
                let message = format!(
                    "reply {} names command {} but the request was for command {}",
                    sequence, command, entry.command
                );
                conn.report_ioerr(message.clone());
                Err(MinirpcError::MalformedFrame(message))
            } else if frame.header.kind() == FrameKind::ErrorReply {
                match frame.status_code() {
                    Ok(code) => Err(MinirpcError::Remote(Status::from_code(code))),
                    Err(e) => {
                        conn.report_ioerr(e.to_string());
                        Err(e)
                    }
                }
            } else {
                Ok(frame.payload)
            };
            entry.completion.complete(outcome);
        }
        Resolution::Cancelled => {
            if frame.header.kind() == FrameKind::Reply {
                if let Ok(entry) = conn.protocol().sent_command(command) {
                    if let Err(e) = entry.validate_reply(&frame.payload) {
                        debug!(conn = conn.id(), command, sequence, error = %e, "late reply is malformed");
                    }
                }
            }
            debug!(conn = conn.id(), command, sequence, "discarding reply for cancelled call");
        }
        Resolution::Unknown => {
            conn.report_ioerr(format!("reply {} matches no pending call", sequence));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_backlog_runs_after_start() {
        let pool = DispatchPool::new("test");
        let (tx, rx) = std_mpsc::channel();
        pool.spawn(Box::pin(async move {
            let _ = tx.send(thread::current().name().map(str::to_string));
        }));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pool.start(1).unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-dispatch-0"));
        pool.stop(true);
    }

    #[test]
    fn test_tasks_spread_over_workers() {
        let pool = DispatchPool::new("spread");
        pool.start(2).unwrap();
        assert_eq!(pool.thread_count(), 2);

        let (tx, rx) = std_mpsc::channel();
        let release = CancellationToken::new();
        for _ in 0..2 {
            let tx = tx.clone();
            let release = release.clone();
            pool.spawn(Box::pin(async move {
                let _ = tx.send(thread::current().id());
                release.cancelled().await;
            }));
        }
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(first, second);

        release.cancel();
        pool.stop(true);
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_stopped_pool_drops_tasks() {
        let pool = DispatchPool::new("stopped");
        pool.stop(true);
        assert!(pool.start(1).is_err());

        struct Flag(std_mpsc::Sender<()>);
        impl Drop for Flag {
            fn drop(&mut self) {
                let _ = self.0.send(());
            }
        }
        let (tx, rx) = std_mpsc::channel();
        let flag = Flag(tx);
        pool.spawn(Box::pin(async move {
            let _flag = flag;
        }));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_run_here_serves_tasks_until_stopped() {
        let pool = Arc::new(DispatchPool::new("here"));
        let (tx, rx) = std_mpsc::channel();
        let sender = tx.clone();
        pool.spawn(Box::pin(async move {
            let _ = sender.send(thread::current().id());
        }));

        let looping = {
            let pool = pool.clone();
            thread::spawn(move || {
                let id = thread::current().id();
                pool.run_here().unwrap();
                id
            })
        };
        let served_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.thread_count(), 1);

        pool.spawn(Box::pin(async move {
            let _ = tx.send(thread::current().id());
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), served_on);

        pool.stop(true);
        assert_eq!(looping.join().unwrap(), served_on);
        assert!(pool.run_here().is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let pool = DispatchPool::new("zero");
        assert!(matches!(pool.start(0), Err(MinirpcError::InvalidArgument(_))));
    }
}
