//! Outbound calls.
//!
//! Two calling conventions are offered on [`Connection`]:
//!
//! - **two-way** ([`call`](Connection::call), [`call_timeout`](Connection::call_timeout),
//!   [`start_call`](Connection::start_call)): a sequence number is allocated,
//!   a pending entry registered and the request queued; the caller blocks
//!   until the dispatch thread resolves the entry
//! - **one-way** ([`call_no_reply`](Connection::call_no_reply)): the request
//!   is queued with the no-reply flag and the call returns immediately
//!
//! Replies are matched purely by sequence number, so any number of two-way
//! calls may be outstanding on one connection and their replies may arrive
//! in any order.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use minirpc_common::{codec, write_frame, FrameHeader, MinirpcError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::connection::{Connection, ConnectionState};
use crate::pending::Completion;

impl<C: Send + Sync + 'static> Connection<C> {
    /// Issues a two-way call and blocks until its reply arrives.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::UnknownCommand`] / [`MinirpcError::InvalidProtocol`]
    ///   if the protocol does not send `command` with these types
    /// - [`MinirpcError::NotConnected`] unless the connection is CONNECTED
    /// - [`MinirpcError::FrameTooLarge`] if the encoded request exceeds the
    ///   maximum payload; nothing is sent and the connection stays up
    /// - [`MinirpcError::QueueFull`] if the outbound queue has no room
    /// - [`MinirpcError::Remote`] with the peer's status for an error reply
    /// - [`MinirpcError::Disconnected`] if the connection closes first
    ///
    /// # Example
    ///
    /// ```no_run
    /// use minirpc::{ConnectionSet, Protocol};
    ///
    /// let protocol = Protocol::<()>::builder("colors")
    ///     .sends::<String, u32>(3)
    ///     .build()?;
    /// let set = ConnectionSet::create(protocol, ());
    /// set.start_dispatch(1)?;
    ///
    /// let conn = set.create_connection(());
    /// conn.connect("127.0.0.1:7000")?;
    /// let count: u32 = conn.call(3, &"teal".to_string())?;
    /// # Ok::<(), minirpc::MinirpcError>(())
    /// ```
    pub fn call<Req, Rep>(&self, command: u32, request: &Req) -> Result<Rep>
    where
        Req: Serialize + 'static,
        Rep: DeserializeOwned + 'static,
    {
        self.start_call(command, request)?.wait()
    }

    /// Like [`call`](Connection::call) but gives up after `timeout`.
    ///
    /// On expiry the call is cancelled and [`MinirpcError::Timeout`] is
    /// returned. The request may still reach the peer; its late reply is
    /// discarded.
    pub fn call_timeout<Req, Rep>(&self, command: u32, request: &Req, timeout: Duration) -> Result<Rep>
    where
        Req: Serialize + 'static,
        Rep: DeserializeOwned + 'static,
    {
        self.start_call(command, request)?.wait_timeout(timeout)
    }

    /// Sends a two-way request without waiting for the reply.
    ///
    /// The returned [`PendingCall`] is waited on or cancelled later.
    /// Dropping it without waiting cancels the call.
    pub fn start_call<Req, Rep>(&self, command: u32, request: &Req) -> Result<PendingCall<C, Rep>>
    where
        Req: Serialize + 'static,
        Rep: DeserializeOwned + 'static,
    {
        self.protocol().sent_command(command)?.check::<Req, Rep>(command)?;
        self.ensure_connected()?;
        let payload = self.encode_request(request)?;

        let (sequence, completion) = self.pending().register(command, self.config().max_pending)?;
        let frame = write_frame(FrameHeader::request(command, sequence), &payload);
        if let Err(e) = self.enqueue(frame) {
            self.pending().forget(sequence);
            return Err(e);
        }

        debug!(conn = self.id(), command, sequence, len = payload.len(), "request queued");
        Ok(PendingCall {
            conn: self.clone(),
            command,
            sequence,
            completion,
            finished: false,
            _reply: PhantomData,
        })
    }

    /// Sends a one-way request.
    ///
    /// Returns once the frame is queued for writing. There is no indication
    /// of whether the peer processed it.
    ///
    /// Nothing throttles a sender that outpaces the peer except the
    /// outbound queue: once [`SetConfig::max_queued_frames`](crate::SetConfig)
    /// frames are waiting, further calls fail with
    /// [`MinirpcError::QueueFull`] until the writer catches up.
    pub fn call_no_reply<Req>(&self, command: u32, request: &Req) -> Result<()>
    where
        Req: Serialize + 'static,
    {
        self.protocol().sent_command(command)?.check_request::<Req>(command)?;
        self.ensure_connected()?;
        let payload = self.encode_request(request)?;

        let sequence = self.pending().next_sequence();
        self.enqueue(write_frame(FrameHeader::one_way(command, sequence), &payload))?;

        debug!(conn = self.id(), command, sequence, len = payload.len(), "one-way request queued");
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(MinirpcError::NotConnected),
        }
    }

    fn encode_request<Req: Serialize>(&self, request: &Req) -> Result<Vec<u8>> {
        let payload = codec::encode(request)?;
        let max = self.config().max_payload_len;
        if payload.len() > max {
            return Err(MinirpcError::FrameTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(payload)
    }
}

/// An outstanding two-way call.
pub struct PendingCall<C: Send + Sync + 'static, Rep> {
    conn: Connection<C>,
    command: u32,
    sequence: u32,
    completion: Arc<Completion>,
    finished: bool,
    _reply: PhantomData<fn() -> Rep>,
}

impl<C: Send + Sync + 'static, Rep: DeserializeOwned> PendingCall<C, Rep> {
    pub fn command(&self) -> u32 {
        self.command
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// True once a reply, disconnect or cancellation has resolved the call.
    pub fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Cancels the call. Returns false if it was already resolved.
    pub fn cancel(&self) -> bool {
        self.conn.pending().cancel(self.sequence)
    }

    /// Handle for cancelling the call from another thread while this one
    /// waits.
    pub fn cancel_handle(&self) -> CancelHandle<C> {
        CancelHandle {
            conn: self.conn.clone(),
            sequence: self.sequence,
        }
    }

    /// Blocks until the call is resolved and decodes the reply.
    pub fn wait(mut self) -> Result<Rep> {
        self.finished = true;
        let payload = self.completion.wait()?;
        Ok(codec::decode(&payload)?)
    }

    /// Blocks for at most `timeout`; on expiry the call is cancelled and
    /// [`MinirpcError::Timeout`] returned.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<Rep> {
        self.finished = true;
        let payload = match self.completion.wait_timeout(timeout) {
            Some(outcome) => outcome?,
            None => {
                if self.conn.pending().cancel(self.sequence) {
                    debug!(
                        conn = self.conn.id(),
                        command = self.command,
                        sequence = self.sequence,
                        "call timed out"
                    );
                    return Err(MinirpcError::Timeout(timeout.as_millis() as u64));
                }
                // resolved between the timeout and the cancel
                self.completion.wait()?
            }
        };
        Ok(codec::decode(&payload)?)
    }
}

impl<C: Send + Sync + 'static, Rep> Drop for PendingCall<C, Rep> {
    fn drop(&mut self) {
        if !self.finished && !self.completion.is_resolved() {
            self.conn.pending().cancel(self.sequence);
        }
    }
}

/// Cancels one outstanding call from any thread.
pub struct CancelHandle<C> {
    conn: Connection<C>,
    sequence: u32,
}

impl<C> Clone for CancelHandle<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            sequence: self.sequence,
        }
    }
}

impl<C> CancelHandle<C> {
    /// Cancels the call; its waiter returns [`MinirpcError::Cancelled`].
    /// Returns false if the call was already resolved.
    pub fn cancel(&self) -> bool {
        self.conn.pending().cancel(self.sequence)
    }
}
